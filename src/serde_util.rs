//! Serde adapters for optional durations written as integer counts of a unit.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Writes `count` as an int32 when it fits and as an int64 otherwise.
fn serialize_count<S: Serializer>(count: u128, serializer: S) -> Result<S::Ok, S::Error> {
    match i32::try_from(count) {
        Ok(small) => serializer.serialize_i32(small),
        Err(_) => serializer.serialize_i64(i64::try_from(count).unwrap_or(i64::MAX)),
    }
}

/// Reads an optional count where any negative value (conventionally -1) means unset.
fn deserialize_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let count = Option::<i64>::deserialize(deserializer)?;
    Ok(count.and_then(|c| u64::try_from(c).ok()))
}

pub(crate) mod duration_option_as_int_seconds {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serialize_count(duration.as_secs().into(), serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(deserialize_count(deserializer)?.map(Duration::from_secs))
    }
}

pub(crate) mod duration_option_as_int_millis {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serialize_count(duration.as_millis(), serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(deserialize_count(deserializer)?.map(Duration::from_millis))
    }
}
