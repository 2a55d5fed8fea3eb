use tokio::io::AsyncRead;
use tokio::sync::watch;

use crate::common::frame::{FrameParser, FramedReader};
use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::error::RequestError;
use crate::server::connection::Connection;
use crate::server::task::{Envelope, Message, Submitter};

/// What a session does after receiving bytes that cannot be framed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FrameErrorPolicy {
    /// the stream can't be resynchronized (TCP)
    Close,
    /// discard what was buffered and keep reading (serial)
    Discard,
}

/// Reads frames off one connection and submits them to the worker
pub(crate) struct SessionTask<T>
where
    T: FrameParser,
{
    reader: FramedReader<T>,
    connection: Connection,
    submitter: Submitter,
    decode: watch::Receiver<DecodeLevel>,
    policy: FrameErrorPolicy,
}

impl<T> SessionTask<T>
where
    T: FrameParser,
{
    pub(crate) fn new(
        parser: T,
        connection: Connection,
        submitter: Submitter,
        decode: watch::Receiver<DecodeLevel>,
        policy: FrameErrorPolicy,
    ) -> Self {
        Self {
            reader: FramedReader::new(parser),
            connection,
            submitter,
            decode,
            policy,
        }
    }

    /// Run until the connection is closed, the stream fails or the server shuts down
    pub(crate) async fn run<R>(&mut self, io: &mut PhysLayer<R>) -> RequestError
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Err(err) = self.run_one(io).await {
                return err;
            }
        }
    }

    async fn run_one<R>(&mut self, io: &mut PhysLayer<R>) -> Result<(), RequestError>
    where
        R: AsyncRead + Unpin,
    {
        let decode = *self.decode.borrow();

        let result = tokio::select! {
            _ = self.connection.closed() => return Err(RequestError::Shutdown),
            result = self.reader.next_frame(io, decode) => result,
        };

        match result {
            Ok(frame) => {
                let envelope = Envelope::new(Box::new(frame), self.connection.clone());
                self.submitter.send(Message::Request(envelope))?;
                Ok(())
            }
            Err(RequestError::BadFrame(err)) if self.policy == FrameErrorPolicy::Discard => {
                tracing::warn!("discarding received data: {}", err);
                self.reader.reset();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
