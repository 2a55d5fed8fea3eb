use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::decode::PhysDecodeLevel;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a transport connection, shared between its session and queued requests
///
/// Closing cancels the token observed by the session reading from the same connection.
#[derive(Clone)]
pub(crate) struct Connection {
    writer: Arc<Mutex<Writer>>,
    token: CancellationToken,
    inter_frame_delay: Option<Duration>,
    persistent: bool,
}

impl Connection {
    pub(crate) fn new<W>(writer: W, token: CancellationToken) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            token,
            inter_frame_delay: None,
            persistent: false,
        }
    }

    /// silent interval observed before every write on a serial line
    pub(crate) fn with_inter_frame_delay(mut self, delay: Duration) -> Self {
        self.inter_frame_delay = Some(delay);
        self
    }

    /// a failed write does not close the connection (serial lines)
    pub(crate) fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) async fn write(
        &self,
        data: &[u8],
        decode_level: PhysDecodeLevel,
    ) -> Result<(), std::io::Error> {
        if self.is_closed() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        }

        let mut writer = self.writer.lock().await;
        if let Some(delay) = self.inter_frame_delay {
            tokio::time::sleep(delay).await;
        }
        crate::common::phys::write(writer.as_mut(), data, decode_level).await
    }

    /// ask the session that owns this connection to stop
    pub(crate) fn close(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn closed(&self) {
        self.token.cancelled().await
    }

    /// close and then shut down the write half of the underlying stream
    pub(crate) async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!("error shutting down connection: {}", err);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("persistent", &self.persistent)
            .finish()
    }
}
