/// The server was shut down and can no longer accept the operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("the server has been shut down")]
pub struct Shutdown;

/// Errors that prevent a listener or a serial port from being added to a server
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    /// Unable to bind or configure the socket
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Unable to open the serial port
    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
    /// The server has been closed
    #[error(transparent)]
    Shutdown(#[from] Shutdown),
}

/// Errors that end a transport session
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// An I/O error occurred on the underlying stream
    #[error("i/o error: {0}")]
    Io(std::io::ErrorKind),
    /// A frame could not be parsed from the stream
    #[error("bad frame: {0}")]
    BadFrame(#[from] FrameParseError),
    /// An internal error occurred while reading or writing a buffer
    #[error("internal error: {0}")]
    Internal(#[from] InternalError),
    /// The session was asked to shut down
    #[error("the session was shut down")]
    Shutdown,
}

/// Errors that occur while parsing a frame off a stream (TCP or serial)
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameParseError {
    /// Received TCP frame with the length field set to zero
    #[error("received TCP frame with the length field set to zero")]
    MbapLengthZero,
    /// Received TCP frame with a length that leaves no room for a function code
    #[error("received TCP frame without a function code")]
    MissingFunctionCode,
    /// Received TCP frame with length that exceeds max allowed size
    #[error("received TCP frame with length ({0}) that exceeds max allowed size ({1})")]
    MbapLengthTooBig(usize, usize),
    /// Received TCP frame within non-Modbus protocol id
    #[error("received TCP frame with non-Modbus protocol id: {0}")]
    UnknownProtocolId(u16),
    /// Received a serial frame whose CRC does not match its contents
    #[error("received serial frame with CRC ({0:#06X}) that doesn't match the calculated CRC ({1:#06X})")]
    CrcValidationFailure(u16, u16),
    /// Received a serial frame that is longer than the maximum frame size
    #[error("received serial frame of length ({0}) that exceeds max allowed size ({1})")]
    FrameLengthTooBig(usize, usize),
    /// Received a serial frame too short to contain an address, function and CRC
    #[error("received serial frame of length ({0}) that is too short to be valid")]
    FrameLengthTooSmall(usize),
}

/// Errors that indicate a bug in the library's buffer handling
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InternalError {
    /// Attempted to read more bytes than present
    #[error("attempted to read {0} bytes with only {1} remaining")]
    InsufficientBytesForRead(usize, usize),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err.kind())
    }
}

impl From<Shutdown> for RequestError {
    fn from(_: Shutdown) -> Self {
        RequestError::Shutdown
    }
}
