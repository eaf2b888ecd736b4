use super::{
    Channel, ChannelEvent, ChannelRequest, ConnectParams, Connector, Error, LocalForward,
    SessionBuilder, Transport,
};

use async_trait::async_trait;

pub(crate) mod builder;

mod channel;

mod session;
pub use session::Session;

/// Opens sessions with the system OpenSSH client.
///
/// Each connection is an `ssh` ControlMaster living in its own private temporary directory;
/// commands, port forwards and teardown all go through that master's control socket.
#[derive(Debug, Clone, Default)]
pub struct OpenSsh {
    base: SessionBuilder,
}

impl OpenSsh {
    /// A connector that uses the default [`SessionBuilder`] settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that starts every session from `base`, then applies the per-connection
    /// [`ConnectParams`] on top.
    pub fn with_builder(base: SessionBuilder) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Connector for OpenSsh {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Transport>, Error> {
        let mut builder = self.base.clone();
        builder.apply(params);
        let session = builder.connect(&params.host).await?;
        Ok(Box::new(session))
    }
}
