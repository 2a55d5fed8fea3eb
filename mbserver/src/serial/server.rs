use tokio::io::AsyncRead;

use crate::common::phys::PhysLayer;
use crate::error::RequestError;
use crate::serial::frame::RtuParser;
use crate::server::session::SessionTask;

/// Serves RTU requests on one port until the server closes or the stream fails
pub(crate) struct RtuServerTask {
    pub(crate) port: String,
    pub(crate) session: SessionTask<RtuParser>,
}

impl RtuServerTask {
    pub(crate) async fn run<R>(&mut self, phys: &mut PhysLayer<R>)
    where
        R: AsyncRead + Unpin,
    {
        tracing::info!("serving port {}", self.port);
        match self.session.run(phys).await {
            RequestError::Shutdown => tracing::info!("port {} shut down", self.port),
            err => tracing::warn!("port {} stopped serving requests: {}", self.port, err),
        }
    }
}
