//! Criteria used to choose which server an operation runs against.

use std::{collections::HashMap, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::public::ServerInfo,
};

/// How an operation picks the server it runs against.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// Select by server role, tags and staleness.
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// Select any available server for which the predicate returns `true`. Latency windowing
    /// still applies to the matches.
    #[display("Custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

/// Predicates never compare equal, not even to themselves.
impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(this), Self::ReadPreference(that)) => this == that,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_preference: ReadPreference) -> Self {
        Self::ReadPreference(read_preference)
    }
}

impl SelectionCriteria {
    /// Matches only the server at `address`, as long as it is available.
    pub fn from_address(address: ServerAddress) -> Self {
        Self::Predicate(Arc::new(move |server| *server.address() == address))
    }
}

impl<'de> Deserialize<'de> for SelectionCriteria {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        ReadPreference::deserialize(deserializer).map(Self::ReadPreference)
    }
}

/// Decides whether a server is suitable. See [`SelectionCriteria::Predicate`].
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Which replica set members an operation may be routed to.
///
/// Every mode other than `Primary` can narrow its candidates further with tag sets and a maximum
/// staleness.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// The primary only.
    Primary,

    /// Secondaries only.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// The primary, or a secondary while there is no primary.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// A secondary, or the primary while no secondary matches.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Any data-bearing member within the latency window.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ Mode: {}", self.mode())?;
        if let Some(tag_sets) = self.tag_sets() {
            write!(f, ", Tag Sets: {:?}", tag_sets)?;
        }
        if let Some(max_staleness) = self.max_staleness() {
            write!(f, ", Max Staleness: {:?}", max_staleness)?;
        }
        f.write_str(" }")
    }
}

/// The document form of a read preference: a `mode` string next to the flattened options.
#[serde_with::skip_serializing_none]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadPreferenceDocument<'a> {
    mode: std::borrow::Cow<'a, str>,
    #[serde(flatten)]
    options: Option<std::borrow::Cow<'a, ReadPreferenceOptions>>,
}

impl<'de> Deserialize<'de> for ReadPreference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let document = ReadPreferenceDocument::deserialize(deserializer)?;
        let options = document.options.map(|o| o.into_owned()).unwrap_or_default();
        let options = Some(options);
        match document.mode.to_ascii_lowercase().as_str() {
            "primary" => match options.filter(|o| !o.is_default()) {
                Some(options) => Err(D::Error::custom(format!(
                    "cannot specify options for primary read preference, got {:?}",
                    options
                ))),
                None => Ok(Self::Primary),
            },
            "secondary" => Ok(Self::Secondary { options }),
            "primarypreferred" => Ok(Self::PrimaryPreferred { options }),
            "secondarypreferred" => Ok(Self::SecondaryPreferred { options }),
            "nearest" => Ok(Self::Nearest { options }),
            other => Err(D::Error::custom(format!(
                "Unknown read preference mode: {}",
                other
            ))),
        }
    }
}

impl Serialize for ReadPreference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ReadPreferenceDocument {
            mode: self.mode().into(),
            options: self.options().map(std::borrow::Cow::Borrowed),
        }
        .serialize(serializer)
    }
}

/// Narrowing options for every mode except `Primary`.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tried in order. Selection uses the first tag set that any candidate matches.
    #[serde(alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// How far a secondary's writes may lag the primary's before it stops being eligible.
    ///
    /// Must be at least 90 seconds, and at least the heartbeat frequency plus the server's idle
    /// write period. Smaller values fail server selection with an error.
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        with = "crate::serde_util::duration_option_as_int_seconds"
    )]
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    /// No staleness bound and no tag set other than the match-everything `{}`.
    pub(crate) fn is_default(&self) -> bool {
        let tags_match_all = match self.tag_sets.as_deref() {
            None | Some([]) => true,
            Some([only]) => only.is_empty(),
            Some(_) => false,
        };
        self.max_staleness.is_none() && tags_match_all
    }
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    /// The options of a non-primary mode, created empty if absent.
    fn options_mut(&mut self, setting: &str) -> Result<&mut ReadPreferenceOptions> {
        match self {
            Self::Primary => Err(Error::invalid_argument(format!(
                "{} can only be specified when a non-primary mode is specified",
                setting
            ))),
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => Ok(options.get_or_insert_with(Default::default)),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options()?.max_staleness
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options()?.tag_sets.as_ref()
    }

    /// Replaces the tag sets. Fails for `Primary`.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        self.options_mut("read preference tags")?.tag_sets = Some(tag_sets);
        Ok(self)
    }

    /// Replaces the max staleness. Fails for `Primary`.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        self.options_mut("max staleness")?.max_staleness = Some(max_staleness);
        Ok(self)
    }
}

/// Every key/value pair of a tag set must be present in a server's tags for the set to match.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bson::doc;
    use pretty_assertions::assert_eq;

    use super::{ReadPreference, ReadPreferenceOptions};

    #[test]
    fn read_preference_document_shape() {
        let read_pref = ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .max_staleness(Duration::from_secs(120))
                    .build(),
            ),
        };
        let doc = bson::to_document(&read_pref).unwrap();
        assert_eq!(doc, doc! { "mode": "secondary", "maxStalenessSeconds": 120 });

        let parsed: ReadPreference = bson::from_document(doc! {
            "mode": "Nearest",
            "tagSets": [{ "dc": "ny" }, {}],
            "maxStalenessSeconds": -1,
        })
        .unwrap();
        assert_eq!(parsed.mode(), "nearest");
        assert_eq!(parsed.tag_sets().map(Vec::len), Some(2));
        assert_eq!(parsed.max_staleness(), None);
    }

    #[test]
    fn primary_rejects_options() {
        let result: Result<ReadPreference, _> =
            bson::from_document(doc! { "mode": "primary", "maxStalenessSeconds": 100 });
        assert!(result.is_err());
        assert!(ReadPreference::Primary.with_tags(Vec::new()).is_err());
    }
}
