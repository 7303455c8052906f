use crate::{
    cmap::Connection,
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, Credential},
    transport::Command,
};

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello command to send when handshaking. This will always be identical given the same
    /// client options, so it can be built once up front.
    command: Command,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let mut command = hello_command(
            options.server_api.as_ref(),
            options.load_balanced,
            None,
            None,
        );
        command
            .body
            .insert("client", options.client_metadata());

        Self { command }
    }

    /// The command this handshaker sends, with mechanism negotiation added for `credential`.
    pub(crate) fn command(&self, credential: Option<&Credential>) -> Command {
        let mut command = self.command.clone();
        if let Some(credential) = credential {
            credential.append_needed_mechanism_negotiation(&mut command.body);
        }
        command
    }

    /// Handshakes a connection, recording the reply on it.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        credential: Option<&Credential>,
    ) -> Result<HelloReply> {
        let reply = run_hello(conn, self.command(credential)).await?;
        conn.hello_reply = Some(reply.clone());
        Ok(reply)
    }
}
