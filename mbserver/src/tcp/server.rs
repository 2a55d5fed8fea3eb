use std::collections::BTreeMap;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::server::connection::Connection;
use crate::server::session::{FrameErrorPolicy, SessionTask};
use crate::server::task::{Message, Submitter};
use crate::tcp::frame::MbapParser;

/// Keeps track of the sessions accepted by one listener, closing the oldest when full
struct SessionTracker {
    max: Option<usize>,
    id: u64,
    sessions: BTreeMap<u64, Connection>,
}

impl SessionTracker {
    fn new(max: Option<usize>) -> Self {
        Self {
            max,
            id: 0,
            sessions: BTreeMap::new(),
        }
    }

    fn get_next_id(&mut self) -> u64 {
        let ret = self.id;
        self.id += 1;
        ret
    }

    fn add(&mut self, connection: Connection) -> u64 {
        // sessions that ended on their own have already closed their connection
        self.sessions.retain(|_, session| !session.is_closed());

        if let Some(max) = self.max {
            while !self.sessions.is_empty() && self.sessions.len() >= max {
                if let Some((id, oldest)) = self.sessions.pop_first() {
                    tracing::warn!("exceeded max connections, closing oldest session: {}", id);
                    oldest.close();
                }
            }
        }

        let id = self.get_next_id();
        self.sessions.insert(id, connection);
        id
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn close_all(&mut self) {
        for connection in self.sessions.values() {
            connection.close();
        }
        self.sessions.clear();
    }
}

/// Accept loop of a single listener
pub(crate) struct ServerTask {
    listener: TcpListener,
    tracker: SessionTracker,
    submitter: Submitter,
    decode: watch::Receiver<DecodeLevel>,
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ServerTask {
    pub(crate) fn new(
        listener: TcpListener,
        max_sessions: Option<usize>,
        submitter: Submitter,
        decode: watch::Receiver<DecodeLevel>,
        token: CancellationToken,
        sessions: TaskTracker,
    ) -> Self {
        Self {
            listener,
            tracker: SessionTracker::new(max_sessions),
            submitter,
            decode,
            token,
            sessions,
        }
    }

    pub(crate) async fn run(&mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    tracing::info!("closing listener and {} session(s)", self.tracker.len());
                    self.tracker.close_all();
                    return;
                }
                result = self.listener.accept() => {
                    match result {
                        Err(err) => {
                            tracing::error!("error accepting connection: {}", err);
                            self.tracker.close_all();
                            return;
                        }
                        Ok((socket, addr)) => self.handle(socket, addr),
                    }
                }
            }
        }
    }

    fn handle(&mut self, socket: TcpStream, addr: SocketAddr) {
        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!("unable to disable Nagle's algorithm: {}", err);
        }

        let (reader, writer) = socket.into_split();
        // cancelling the listener also cancels every session it accepted
        let connection = Connection::new(writer, self.token.child_token());
        let id = self.tracker.add(connection.clone());

        tracing::info!("accepted connection {} from: {}", id, addr);

        let mut session = SessionTask::new(
            MbapParser::new(),
            connection.clone(),
            self.submitter.clone(),
            self.decode.clone(),
            FrameErrorPolicy::Close,
        );

        let submitter = self.submitter.clone();
        self.sessions.spawn(
            async move {
                let mut phys = PhysLayer::new(reader);
                let err = session.run(&mut phys).await;
                tracing::info!("shutdown session {}: {}", id, err);
                // requests already queued are answered before the stream is shut down
                if submitter.send(Message::Release(connection.clone())).is_err() {
                    connection.shutdown().await;
                }
            }
            .instrument(tracing::info_span!("Session", "remote" = ?addr)),
        );
    }
}
