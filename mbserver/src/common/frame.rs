use tokio::io::AsyncRead;

use crate::common::buffer::ReadBuffer;
use crate::common::function::FunctionDisplay;
use crate::common::phys::PhysLayer;
use crate::decode::{AppDecodeLevel, DecodeLevel, FrameDecodeLevel};
use crate::error::RequestError;
use crate::exception::ExceptionCode;
use crate::types::UnitId;

pub(crate) mod constants {
    /// function code + data
    pub(crate) const MAX_PDU_LENGTH: usize = 253;
}

/// A decoded Modbus message: unit id, function code and the data that follows it
///
/// Implemented by the TCP ([`crate::tcp::TcpFrame`]) and serial ([`crate::serial::RtuFrame`])
/// codecs. The dispatch engine only ever interacts with frames through this trait.
pub trait Frame: Send + std::fmt::Debug + 'static {
    /// unit identifier the frame is addressed to
    fn unit_id(&self) -> UnitId;

    /// raw function code
    fn function(&self) -> u8;

    /// the data that follows the function code
    fn payload(&self) -> &[u8];

    /// replace the data that follows the function code
    fn set_payload(&mut self, payload: &[u8]);

    /// turn the frame into an exception response carrying `ex`
    fn set_exception(&mut self, ex: ExceptionCode);

    /// create a response shell that shares the addressing (and transaction) metadata of this frame
    fn response(&self) -> Box<dyn Frame>;

    /// serialize the complete frame as it is sent on the wire
    fn to_bytes(&self) -> Vec<u8>;

    /// write a description of the framing header used when logging
    fn fmt_header(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result;
}

/// Defines an interface for reading complete request frames (TCP or RTU) off a stream
pub(crate) trait FrameParser {
    type Output: Frame;

    fn max_frame_size(&self) -> usize;

    /// Parse bytes using the provided cursor. Advancing the cursor always implies that the bytes
    /// are consumed and can be discarded,
    ///
    /// Err implies the input data is invalid
    /// Ok(None) implies that more data is required to complete parsing
    /// Ok(Some(..)) will contain a fully parsed frame and will advance the Cursor appropriately
    fn parse(
        &mut self,
        cursor: &mut ReadBuffer,
        decode_level: FrameDecodeLevel,
    ) -> Result<Option<Self::Output>, RequestError>;

    /// discard any partially parsed state
    fn reset(&mut self);
}

pub(crate) struct FramedReader<T>
where
    T: FrameParser,
{
    parser: T,
    buffer: ReadBuffer,
}

impl<T: FrameParser> FramedReader<T> {
    pub(crate) fn new(parser: T) -> Self {
        let size = parser.max_frame_size();
        Self {
            parser,
            buffer: ReadBuffer::new(size),
        }
    }

    /// discard any buffered bytes and partial parser state
    pub(crate) fn reset(&mut self) {
        self.parser.reset();
        self.buffer.clear();
    }

    pub(crate) async fn next_frame<R: AsyncRead + Unpin>(
        &mut self,
        io: &mut PhysLayer<R>,
        decode_level: DecodeLevel,
    ) -> Result<T::Output, RequestError> {
        loop {
            match self.parser.parse(&mut self.buffer, decode_level.frame)? {
                Some(frame) => return Ok(frame),
                None => {
                    self.buffer.read_some(io, decode_level.physical).await?;
                }
            }
        }
    }
}

/// Logs the framing header and, optionally, the serialized bytes of a frame
pub(crate) struct FrameDisplay<'a> {
    level: FrameDecodeLevel,
    frame: &'a dyn Frame,
    bytes: &'a [u8],
}

impl<'a> FrameDisplay<'a> {
    pub(crate) fn new(level: FrameDecodeLevel, frame: &'a dyn Frame, bytes: &'a [u8]) -> Self {
        Self {
            level,
            frame,
            bytes,
        }
    }
}

impl std::fmt::Display for FrameDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.frame.fmt_header(f)?;
        if self.level.payload_enabled() {
            crate::common::phys::format_bytes(f, self.bytes)?;
        }
        Ok(())
    }
}

/// Logs a PDU, i.e. the function code and the data that follows it
pub(crate) struct PduDisplay<'a> {
    level: AppDecodeLevel,
    frame: &'a dyn Frame,
}

impl<'a> PduDisplay<'a> {
    pub(crate) fn new(level: AppDecodeLevel, frame: &'a dyn Frame) -> Self {
        Self { level, frame }
    }
}

impl std::fmt::Display for PduDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", FunctionDisplay::new(self.frame.function()))?;
        if self.level.data_headers() {
            write!(f, " (data len = {})", self.frame.payload().len())?;
        }
        if self.level.data_values() {
            crate::common::phys::format_bytes(f, self.frame.payload())?;
        }
        Ok(())
    }
}
