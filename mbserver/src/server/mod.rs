use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::error::{ListenError, Shutdown};
use crate::serial::frame::RtuParser;
use crate::serial::server::RtuServerTask;
use crate::tcp::server::ServerTask;
use crate::types::UnitId;

use connection::Connection;
use handler::DispatchTable;
use session::{FrameErrorPolicy, SessionTask};
use task::{Message, Submitter, UnitFilter, Worker};

pub(crate) mod connection;
pub(crate) mod functions;
pub(crate) mod handler;
pub(crate) mod memory;
pub(crate) mod session;
pub(crate) mod task;

pub use handler::FunctionHandler;
pub use memory::{BankCapacity, Memory};

/// Settings applied when a [`Server`] is spawned
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerSettings {
    /// frames addressed to any other unit are ignored
    pub unit_id: UnitId,
    /// number of cells in each memory bank
    pub capacity: BankCapacity,
    /// maximum time spent writing a single response before the connection is closed
    pub write_timeout: Duration,
    /// maximum number of concurrent sessions per TCP listener, `None` for no limit
    ///
    /// When a new connection would exceed the limit, the oldest session is closed.
    pub max_sessions: Option<usize>,
    /// initial decode level, see [`Server::set_decode_level`]
    pub decode: DecodeLevel,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            unit_id: UnitId::default(),
            capacity: BankCapacity::default(),
            write_timeout: Duration::from_secs(1),
            max_sessions: None,
            decode: DecodeLevel::default(),
        }
    }
}

struct ListenerHandle {
    addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct PortHandle {
    name: String,
    connection: Connection,
}

struct Transports {
    closed: bool,
    listeners: Vec<ListenerHandle>,
    ports: Vec<PortHandle>,
    worker: Option<JoinHandle<()>>,
}

/// A Modbus slave shared by any number of TCP listeners and serial ports
///
/// Every request, from every transport, is processed in arrival order by a single worker task
/// which owns the [`Memory`] and the function dispatch table. Registration of handlers and
/// external memory access travel through the same queue, so they are ordered with respect to
/// requests.
///
/// Dropping the server stops its listeners and ports without waiting for them. Use
/// [`Server::close`] for an orderly shutdown.
pub struct Server {
    unit_id: UnitId,
    max_sessions: Option<usize>,
    submitter: Submitter,
    decode: watch::Sender<DecodeLevel>,
    transports: Mutex<Transports>,
    sessions: TaskTracker,
    ports_token: CancellationToken,
    port_tasks: TaskTracker,
}

impl Server {
    /// Allocate the memory banks, install the standard functions and spawn the worker task
    ///
    /// Must be called from within the context of a Tokio runtime.
    pub fn spawn(settings: ServerSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (decode, decode_rx) = watch::channel(settings.decode);

        let worker = Worker::new(
            UnitFilter::new(settings.unit_id),
            Memory::new(settings.capacity),
            DispatchTable::with_defaults(),
            rx,
            decode_rx,
            settings.write_timeout,
        );

        let worker = tokio::spawn(
            worker
                .run()
                .instrument(tracing::info_span!("Modbus-Server", "unit" = %settings.unit_id)),
        );

        Self {
            unit_id: settings.unit_id,
            max_sessions: settings.max_sessions,
            submitter: Submitter::new(tx),
            decode,
            transports: Mutex::new(Transports {
                closed: false,
                listeners: Vec::new(),
                ports: Vec::new(),
                worker: Some(worker),
            }),
            sessions: TaskTracker::new(),
            ports_token: CancellationToken::new(),
            port_tasks: TaskTracker::new(),
        }
    }

    /// unit identifier this server answers to
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Change the decode level used by the worker and every session
    pub fn set_decode_level(&self, level: DecodeLevel) {
        self.decode.send_replace(level);
    }

    /// Install `handler` for `code`, replacing the current handler if there is one
    ///
    /// Takes effect for every request submitted after this call.
    pub fn register<H>(&self, code: u8, handler: H) -> Result<(), Shutdown>
    where
        H: FunctionHandler,
    {
        self.submitter.send(Message::Register(code, Box::new(handler)))
    }

    /// Remove the handler for `code`, subsequent requests are answered with `IllegalFunction`
    pub fn unregister(&self, code: u8) -> Result<(), Shutdown> {
        self.submitter.send(Message::Unregister(code))
    }

    /// Run `access` on the worker task with exclusive access to the memory banks
    ///
    /// Used to seed or inspect the process image. The closure runs after every request
    /// submitted before it.
    pub async fn memory<F, R>(&self, access: F) -> Result<R, Shutdown>
    where
        F: FnOnce(&mut Memory) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submitter
            .send(Message::Access(Box::new(move |memory: &mut Memory| {
                // the caller may have stopped waiting
                let _ = tx.send(access(memory));
            })))?;
        rx.await.map_err(|_| Shutdown)
    }

    /// Bind a TCP listener and start accepting connections on it
    ///
    /// Returns the local address, which is useful when binding port 0.
    pub async fn listen_tcp<A>(&self, addr: A) -> Result<SocketAddr, ListenError>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        self.add_listener(listener).await
    }

    /// Start accepting connections on an already bound listener
    pub async fn add_listener(&self, listener: TcpListener) -> Result<SocketAddr, ListenError> {
        let addr = listener.local_addr()?;

        let mut transports = self.transports.lock().await;
        if transports.closed {
            return Err(Shutdown.into());
        }

        let token = CancellationToken::new();
        let mut task = ServerTask::new(
            listener,
            self.max_sessions,
            self.submitter.clone(),
            self.decode.subscribe(),
            token.clone(),
            self.sessions.clone(),
        );

        let task = tokio::spawn(
            async move { task.run().await }
                .instrument(tracing::info_span!("Modbus-Server-TCP", "listen" = ?addr)),
        );

        tracing::info!("listening on {}", addr);
        transports.listeners.push(ListenerHandle { addr, token, task });
        Ok(addr)
    }

    /// Serve RTU requests on a stream, typically an open serial port
    ///
    /// `name` is only used for logging.
    pub async fn add_port<S>(&self, name: &str, stream: S) -> Result<(), Shutdown>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.spawn_port(name, stream, None).await
    }

    /// Open a serial port and serve RTU requests on it
    ///
    /// Responses are preceded by the inter-frame delay that corresponds to `settings`.
    #[cfg(feature = "serial")]
    pub async fn listen_rtu(
        &self,
        path: &str,
        settings: crate::serial::SerialSettings,
    ) -> Result<(), ListenError> {
        let port = crate::serial::open(path, settings)?;
        tracing::info!("opened port {}", path);
        self.spawn_port(path, port, Some(settings.inter_frame_delay()))
            .await?;
        Ok(())
    }

    async fn spawn_port<S>(
        &self,
        name: &str,
        stream: S,
        inter_frame_delay: Option<Duration>,
    ) -> Result<(), Shutdown>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut transports = self.transports.lock().await;
        if transports.closed {
            return Err(Shutdown);
        }

        let (reader, writer) = tokio::io::split(stream);
        let mut connection = Connection::new(writer, self.ports_token.child_token()).persistent();
        if let Some(delay) = inter_frame_delay {
            connection = connection.with_inter_frame_delay(delay);
        }

        let mut task = RtuServerTask {
            port: name.to_string(),
            session: SessionTask::new(
                RtuParser::new(),
                connection.clone(),
                self.submitter.clone(),
                self.decode.subscribe(),
                FrameErrorPolicy::Discard,
            ),
        };

        self.port_tasks.spawn(
            async move {
                let mut phys = PhysLayer::new(reader);
                task.run(&mut phys).await;
            }
            .instrument(tracing::info_span!("Modbus-Server-RTU", "port" = %name)),
        );

        transports.ports.push(PortHandle {
            name: name.to_string(),
            connection,
        });
        Ok(())
    }

    /// Gracefully shut down every transport and then the worker
    ///
    /// Listeners stop accepting and their sessions end, serial port sessions are signalled and
    /// awaited before the ports are released, and finally the worker processes everything that
    /// was queued before it stops. Calling this more than once has no further effect.
    pub async fn close(&self) {
        let (listeners, ports, worker) = {
            let mut transports = self.transports.lock().await;
            if transports.closed {
                return;
            }
            transports.closed = true;
            (
                std::mem::take(&mut transports.listeners),
                std::mem::take(&mut transports.ports),
                transports.worker.take(),
            )
        };

        for listener in listeners {
            listener.token.cancel();
            match listener.task.await {
                Ok(()) => tracing::info!("closed listener {}", listener.addr),
                Err(err) => tracing::warn!("listener {} failed: {}", listener.addr, err),
            }
        }
        self.sessions.close();
        self.sessions.wait().await;

        self.ports_token.cancel();
        self.port_tasks.close();
        self.port_tasks.wait().await;
        for port in ports {
            port.connection.shutdown().await;
            tracing::info!("closed port {}", port.name);
        }

        if self.submitter.send(Message::Shutdown).is_err() {
            tracing::debug!("worker already stopped");
        }
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::warn!("worker failed: {}", err);
            }
        }

        tracing::info!("server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let transports = self.transports.get_mut();
        for listener in transports.listeners.iter() {
            listener.token.cancel();
        }
        self.ports_token.cancel();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("unit_id", &self.unit_id)
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::common::frame::Frame;
    use crate::exception::ExceptionCode;
    use crate::serial::RtuFrame;

    use super::*;

    fn settings() -> ServerSettings {
        ServerSettings {
            unit_id: UnitId::new(1),
            capacity: BankCapacity::uniform(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_access_is_ordered_with_registration() {
        let server = Server::spawn(settings());
        server
            .memory(|mem| mem.holding_registers[5] = 1234)
            .await
            .unwrap();
        assert_eq!(
            server.memory(|mem| mem.holding_registers[5]).await,
            Ok(1234)
        );
        server.close().await;
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let server = Server::spawn(settings());
        server.close().await;
        // closing twice is harmless
        server.close().await;

        assert_eq!(server.memory(|_| ()).await, Err(Shutdown));
        assert_eq!(server.unregister(0x01), Err(Shutdown));
        let (stream, _) = tokio::io::duplex(16);
        assert_eq!(server.add_port("test", stream).await, Err(Shutdown));
        assert!(matches!(
            server.listen_tcp("127.0.0.1:0").await,
            Err(ListenError::Shutdown(Shutdown))
        ));
    }

    #[tokio::test]
    async fn serves_tcp_clients_until_closed() {
        let server = Server::spawn(settings());
        let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x05, 0x04, 0xD2])
            .await
            .unwrap();
        let mut response = [0u8; 12];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(
            response,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x05, 0x04, 0xD2]
        );

        server.close().await;

        // the session was ended by the close
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn serves_serial_ports_until_closed() {
        let server = Server::spawn(settings());
        let (local, mut remote) = tokio::io::duplex(256);
        server.add_port("test", local).await.unwrap();

        let request = RtuFrame::new(UnitId::new(1), 0x55, &[]);
        remote.write_all(&request.to_bytes()).await.unwrap();
        let mut expected = request.response();
        expected.set_exception(ExceptionCode::IllegalFunction);
        let expected = expected.to_bytes();
        let mut response = vec![0u8; expected.len()];
        remote.read_exact(&mut response).await.unwrap();
        assert_eq!(response, expected);

        server.close().await;

        let mut rest = Vec::new();
        assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decode_level_can_change_at_runtime() {
        let server = Server::spawn(settings());
        server.set_decode_level(DecodeLevel::everything());
        assert_eq!(*server.decode.borrow(), DecodeLevel::everything());
        server.close().await;
    }
}
