use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::common::frame::{Frame, FrameDisplay, PduDisplay};
use crate::decode::DecodeLevel;
use crate::error::Shutdown;
use crate::exception::ExceptionCode;
use crate::server::connection::Connection;
use crate::server::handler::{DispatchTable, FunctionHandler};
use crate::server::memory::Memory;
use crate::types::UnitId;

/// A decoded request and the connection it arrived on
pub(crate) struct Envelope {
    frame: Box<dyn Frame>,
    connection: Connection,
}

impl Envelope {
    pub(crate) fn new(frame: Box<dyn Frame>, connection: Connection) -> Self {
        Self { frame, connection }
    }

    #[cfg(test)]
    pub(crate) fn frame(&self) -> &dyn Frame {
        self.frame.as_ref()
    }
}

pub(crate) type MemoryAccess = Box<dyn FnOnce(&mut Memory) + Send>;

/// Everything the worker processes, in submission order
pub(crate) enum Message {
    Request(Envelope),
    Register(u8, Box<dyn FunctionHandler>),
    Unregister(u8),
    Access(MemoryAccess),
    /// shut down a connection once the responses queued ahead of this message are written
    Release(Connection),
    /// stop after everything queued ahead of this message has been processed
    Shutdown,
}

/// Producer side of the submission queue
#[derive(Clone)]
pub(crate) struct Submitter {
    tx: mpsc::UnboundedSender<Message>,
}

impl Submitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    pub(crate) fn send(&self, message: Message) -> Result<(), Shutdown> {
        self.tx.send(message).map_err(|_| Shutdown)
    }
}

/// Decides whether a frame is addressed to this server
#[derive(Copy, Clone, Debug)]
pub(crate) struct UnitFilter {
    unit_id: UnitId,
}

impl UnitFilter {
    pub(crate) fn new(unit_id: UnitId) -> Self {
        Self { unit_id }
    }

    pub(crate) fn accepts(&self, frame: &dyn Frame) -> bool {
        frame.unit_id() == self.unit_id
    }
}

/// The only task that touches the memory banks or invokes handlers
pub(crate) struct Worker {
    filter: UnitFilter,
    memory: Memory,
    table: DispatchTable,
    rx: mpsc::UnboundedReceiver<Message>,
    decode: watch::Receiver<DecodeLevel>,
    write_timeout: Duration,
}

impl Worker {
    pub(crate) fn new(
        filter: UnitFilter,
        memory: Memory,
        table: DispatchTable,
        rx: mpsc::UnboundedReceiver<Message>,
        decode: watch::Receiver<DecodeLevel>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            filter,
            memory,
            table,
            rx,
            decode,
            write_timeout,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Request(envelope) => self.dispatch(envelope).await,
                Message::Register(code, handler) => {
                    tracing::debug!("registered handler for function code {:#04X}", code);
                    self.table.register(code, handler);
                }
                Message::Unregister(code) => {
                    tracing::debug!("removed handler for function code {:#04X}", code);
                    self.table.unregister(code);
                }
                Message::Access(access) => access(&mut self.memory),
                Message::Release(connection) => self.release(connection).await,
                Message::Shutdown => break,
            }
        }
        tracing::info!("dispatch worker shut down");
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        let Envelope { frame, connection } = envelope;
        let decode = *self.decode.borrow();

        if !self.filter.accepts(frame.as_ref()) {
            tracing::debug!(
                "ignoring frame for unit {} (this unit is {})",
                frame.unit_id(),
                self.filter.unit_id
            );
            return;
        }

        if decode.app.enabled() {
            tracing::info!("PDU RX - {}", PduDisplay::new(decode.app, frame.as_ref()));
        }

        let mut response = frame.response();
        match self.process(frame.as_ref()) {
            Ok(payload) => response.set_payload(&payload),
            Err(ex) => response.set_exception(ex),
        }

        if decode.app.enabled() {
            tracing::info!("PDU TX - {}", PduDisplay::new(decode.app, response.as_ref()));
        }

        let bytes = response.to_bytes();

        if decode.frame.enabled() {
            tracing::info!(
                "FRAME TX - {}",
                FrameDisplay::new(decode.frame, response.as_ref(), &bytes)
            );
        }

        match tokio::time::timeout(
            self.write_timeout,
            connection.write(&bytes, decode.physical),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.write_failed(&connection, err),
            Err(_) => self.write_failed(
                &connection,
                format!("timed out after {:?}", self.write_timeout),
            ),
        }
    }

    fn write_failed<E>(&self, connection: &Connection, err: E)
    where
        E: std::fmt::Display,
    {
        if connection.is_persistent() {
            tracing::warn!("unable to write response: {}", err);
        } else {
            tracing::warn!("unable to write response, closing connection: {}", err);
            connection.close();
        }
    }

    async fn release(&mut self, connection: Connection) {
        if tokio::time::timeout(self.write_timeout, connection.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("connection shutdown timed out after {:?}", self.write_timeout);
        }
    }

    fn process(&mut self, frame: &dyn Frame) -> Result<Vec<u8>, ExceptionCode> {
        let handler = match self.table.get_mut(frame.function()) {
            Some(handler) => handler,
            None => return Err(ExceptionCode::IllegalFunction),
        };

        let payload = handler.handle(&mut self.memory, frame)?;

        // function code + payload must fit in a PDU
        if payload.len() >= crate::common::frame::constants::MAX_PDU_LENGTH {
            tracing::warn!(
                "handler for function code {:#04X} returned {} bytes, which exceeds the PDU size",
                frame.function(),
                payload.len()
            );
            return Err(ExceptionCode::ServerDeviceFailure);
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::sync::CancellationToken;

    use crate::server::memory::BankCapacity;
    use crate::tcp::TcpFrame;

    use super::*;

    const UNIT: UnitId = UnitId::new(1);

    struct Fixture {
        submitter: Submitter,
        connection: Connection,
        remote: DuplexStream,
        worker: tokio::task::JoinHandle<()>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let (_decode_tx, decode_rx) = watch::channel(DecodeLevel::everything());
            let worker = Worker::new(
                UnitFilter::new(UNIT),
                Memory::new(BankCapacity::uniform(32)),
                DispatchTable::with_defaults(),
                rx,
                decode_rx,
                Duration::from_secs(1),
            );
            let (local, remote) = tokio::io::duplex(1024);
            Self {
                submitter: Submitter::new(tx),
                connection: Connection::new(local, CancellationToken::new()),
                remote,
                worker: tokio::spawn(worker.run()),
            }
        }

        fn submit(&self, unit: UnitId, function: u8, payload: &[u8]) {
            let frame = TcpFrame::new(7, unit, function, payload);
            self.submitter
                .send(Message::Request(Envelope::new(
                    Box::new(frame),
                    self.connection.clone(),
                )))
                .unwrap();
        }

        fn register<F>(&self, code: u8, handler: F)
        where
            F: FnMut(&mut Memory, &dyn Frame) -> Result<Vec<u8>, ExceptionCode> + Send + 'static,
        {
            self.submitter
                .send(Message::Register(code, Box::new(handler)))
                .unwrap();
        }

        async fn memory<R, F>(&self, f: F) -> R
        where
            F: FnOnce(&mut Memory) -> R + Send + 'static,
            R: Send + 'static,
        {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.submitter
                .send(Message::Access(Box::new(move |memory: &mut Memory| {
                    let _ = tx.send(f(memory));
                })))
                .unwrap();
            rx.await.unwrap()
        }

        /// read one MBAP response and return its function code and data
        async fn response(&mut self) -> (u8, Vec<u8>) {
            let mut header = [0u8; 7];
            self.remote.read_exact(&mut header).await.unwrap();
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut pdu = vec![0u8; length - 1];
            self.remote.read_exact(&mut pdu).await.unwrap();
            (pdu[0], pdu[1..].to_vec())
        }

        async fn shutdown(self) -> DuplexStream {
            self.submitter.send(Message::Shutdown).unwrap();
            self.worker.await.unwrap();
            self.remote
        }
    }

    #[tokio::test]
    async fn frames_for_other_units_are_ignored() {
        let fixture = Fixture::new();
        fixture.submit(UnitId::new(2), 0x06, &[0x00, 0x05, 0x04, 0xD2]);
        let value = fixture.memory(|mem| mem.holding_registers[5]).await;
        assert_eq!(value, 0);

        // nothing was written before the connection was dropped
        let Fixture {
            submitter,
            connection,
            mut remote,
            worker,
        } = fixture;
        submitter.send(Message::Shutdown).unwrap();
        worker.await.unwrap();
        drop(connection);
        let mut buffer = Vec::new();
        assert_eq!(remote.read_to_end(&mut buffer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsupported_function_returns_illegal_function() {
        let mut fixture = Fixture::new();
        fixture.submit(UNIT, 0x55, &[0x00, 0x05, 0x04, 0xD2]);
        assert_eq!(fixture.response().await, (0xD5, vec![0x01]));
        let memory = fixture.memory(|mem| mem.clone()).await;
        assert_eq!(memory, Memory::new(BankCapacity::uniform(32)));
    }

    #[tokio::test]
    async fn write_then_read_returns_written_value() {
        let mut fixture = Fixture::new();
        fixture.submit(UNIT, 0x06, &[0x00, 0x05, 0x04, 0xD2]);
        assert_eq!(fixture.response().await, (0x06, vec![0x00, 0x05, 0x04, 0xD2]));
        fixture.submit(UNIT, 0x03, &[0x00, 0x05, 0x00, 0x01]);
        assert_eq!(fixture.response().await, (0x03, vec![0x02, 0x04, 0xD2]));
    }

    #[tokio::test]
    async fn handler_exceptions_are_returned_to_the_client() {
        let mut fixture = Fixture::new();
        fixture.submit(UNIT, 0x03, &[0x00, 0x1F, 0x00, 0x02]);
        assert_eq!(fixture.response().await, (0x83, vec![0x02]));
    }

    #[tokio::test]
    async fn registered_handler_overrides_default() {
        let mut fixture = Fixture::new();
        fixture.register(0x01, |_, _| Ok(vec![0x01, 0xA5]));
        fixture.memory(|mem| mem.coils.fill(true)).await;
        fixture.submit(UNIT, 0x01, &[0x00, 0x00, 0x00, 0x08]);
        assert_eq!(fixture.response().await, (0x01, vec![0x01, 0xA5]));
    }

    #[tokio::test]
    async fn custom_function_can_be_added_and_removed() {
        let mut fixture = Fixture::new();
        fixture.register(0x41, |mem, frame| {
            mem.holding_registers[0] += 1;
            Ok(frame.payload().to_vec())
        });
        fixture.submit(UNIT, 0x41, &[0xAB]);
        assert_eq!(fixture.response().await, (0x41, vec![0xAB]));

        fixture.submitter.send(Message::Unregister(0x41)).unwrap();
        fixture.submit(UNIT, 0x41, &[0xAB]);
        assert_eq!(fixture.response().await, (0xC1, vec![0x01]));
        assert_eq!(fixture.memory(|mem| mem.holding_registers[0]).await, 1);
    }

    #[tokio::test]
    async fn oversized_handler_payload_is_a_device_failure() {
        let mut fixture = Fixture::new();
        fixture.register(0x41, |_, _| Ok(vec![0; 300]));
        fixture.submit(UNIT, 0x41, &[]);
        assert_eq!(fixture.response().await, (0xC1, vec![0x04]));
    }

    #[tokio::test]
    async fn write_failure_closes_only_that_connection() {
        let mut fixture = Fixture::new();
        let (dead, dead_remote) = tokio::io::duplex(64);
        drop(dead_remote);
        let dead = Connection::new(dead, CancellationToken::new());

        let frame = TcpFrame::new(1, UNIT, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        fixture
            .submitter
            .send(Message::Request(Envelope::new(Box::new(frame), dead.clone())))
            .unwrap();

        // the worker keeps serving other connections
        fixture.submit(UNIT, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(fixture.response().await, (0x03, vec![0x02, 0x00, 0x00]));
        assert!(dead.is_closed());
        assert!(!fixture.connection.is_closed());
    }

    #[tokio::test]
    async fn write_failure_keeps_persistent_connection_open() {
        let fixture = Fixture::new();
        let (port, port_remote) = tokio::io::duplex(64);
        drop(port_remote);
        let port = Connection::new(port, CancellationToken::new()).persistent();

        let frame = TcpFrame::new(1, UNIT, 0x06, &[0x00, 0x02, 0x00, 0x07]);
        fixture
            .submitter
            .send(Message::Request(Envelope::new(Box::new(frame), port.clone())))
            .unwrap();

        // the write fails but the request was still processed
        assert_eq!(fixture.memory(|mem| mem.holding_registers[2]).await, 7);
        assert!(!port.is_closed());
    }

    #[tokio::test]
    async fn release_waits_for_queued_responses() {
        let mut fixture = Fixture::new();
        fixture.submit(UNIT, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        fixture
            .submitter
            .send(Message::Release(fixture.connection.clone()))
            .unwrap();

        assert_eq!(fixture.response().await, (0x03, vec![0x02, 0x00, 0x00]));
        let mut rest = Vec::new();
        assert_eq!(fixture.remote.read_to_end(&mut rest).await.unwrap(), 0);
        assert!(fixture.connection.is_closed());
    }

    #[tokio::test]
    async fn shutdown_drains_queued_requests() {
        let fixture = Fixture::new();
        for i in 0..10u16 {
            let [hi, lo] = i.to_be_bytes();
            fixture.submit(UNIT, 0x06, &[hi, lo, 0x00, 0x01]);
        }
        let mut remote = fixture.shutdown().await;
        let mut buffer = vec![0u8; 10 * 12];
        remote.read_exact(&mut buffer).await.unwrap();
    }

    #[test]
    fn unit_filter_compares_unit_ids() {
        let filter = UnitFilter::new(UNIT);
        assert!(filter.accepts(&TcpFrame::new(0, UNIT, 0x01, &[])));
        assert!(!filter.accepts(&TcpFrame::new(0, UnitId::new(2), 0x01, &[])));
        assert!(!filter.accepts(&TcpFrame::new(0, UnitId::broadcast(), 0x01, &[])));
    }
}
