use crate::common::buffer::ReadBuffer;
use crate::common::frame::{Frame, FrameParser};
use crate::constants::function::ERROR_MASK;
use crate::decode::FrameDecodeLevel;
use crate::error::{FrameParseError, RequestError};
use crate::exception::ExceptionCode;
use crate::types::UnitId;

pub(crate) mod constants {
    pub(crate) const HEADER_LENGTH: usize = 7;
    pub(crate) const MAX_FRAME_LENGTH: usize =
        HEADER_LENGTH + crate::common::frame::constants::MAX_PDU_LENGTH;
    // includes the 1 byte unit id
    pub(crate) const MAX_LENGTH_FIELD: usize = crate::common::frame::constants::MAX_PDU_LENGTH + 1;
}

/// A Modbus TCP frame: MBAP header followed by the PDU
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpFrame {
    tx_id: u16,
    protocol_id: u16,
    unit_id: UnitId,
    function: u8,
    data: Vec<u8>,
}

impl TcpFrame {
    /// Create a frame from its fields. The protocol id is always zero.
    pub fn new(tx_id: u16, unit_id: UnitId, function: u8, data: &[u8]) -> Self {
        Self {
            tx_id,
            protocol_id: 0,
            unit_id,
            function,
            data: data.to_vec(),
        }
    }

    /// transaction identifier echoed back in the response
    pub fn tx_id(&self) -> u16 {
        self.tx_id
    }

    /// value of the MBAP length field: unit id, function code and data
    fn length_field(&self) -> usize {
        self.data.len() + 2
    }
}

impl Frame for TcpFrame {
    fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn set_payload(&mut self, payload: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(payload);
    }

    fn set_exception(&mut self, ex: ExceptionCode) {
        self.function |= ERROR_MASK;
        self.data.clear();
        self.data.push(ex.into());
    }

    fn response(&self) -> Box<dyn Frame> {
        Box::new(self.clone())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(constants::HEADER_LENGTH + 1 + self.data.len());
        bytes.extend_from_slice(&self.tx_id.to_be_bytes());
        bytes.extend_from_slice(&self.protocol_id.to_be_bytes());
        // the parser and the handlers bound the data length so this never truncates
        bytes.extend_from_slice(&(self.length_field() as u16).to_be_bytes());
        bytes.push(self.unit_id.value);
        bytes.push(self.function);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    fn fmt_header(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "MBAP tx_id: {:#06X} unit: {} len: {}",
            self.tx_id,
            self.unit_id,
            self.length_field()
        )
    }
}

#[derive(Clone, Copy)]
struct MbapHeader {
    tx_id: u16,
    adu_length: usize,
    unit_id: UnitId,
}

#[derive(Clone, Copy)]
enum ParseState {
    Begin,
    Header(MbapHeader),
}

pub(crate) struct MbapParser {
    state: ParseState,
}

impl MbapParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::Begin,
        }
    }

    fn parse_header(cursor: &mut ReadBuffer) -> Result<MbapHeader, RequestError> {
        let tx_id = cursor.read_u16_be()?;
        let protocol_id = cursor.read_u16_be()?;
        let length = cursor.read_u16_be()? as usize;
        let unit_id = UnitId::new(cursor.read_u8()?);

        if protocol_id != 0 {
            return Err(FrameParseError::UnknownProtocolId(protocol_id).into());
        }

        if length > constants::MAX_LENGTH_FIELD {
            return Err(
                FrameParseError::MbapLengthTooBig(length, constants::MAX_LENGTH_FIELD).into(),
            );
        }

        // must be > 0 b/c the 1-byte unit identifier counts towards length
        if length == 0 {
            return Err(FrameParseError::MbapLengthZero.into());
        }

        // a request without a function code can't be answered
        if length == 1 {
            return Err(FrameParseError::MissingFunctionCode.into());
        }

        Ok(MbapHeader {
            tx_id,
            adu_length: length - 1,
            unit_id,
        })
    }

    fn parse_body(header: &MbapHeader, cursor: &mut ReadBuffer) -> Result<TcpFrame, RequestError> {
        let adu = cursor.read(header.adu_length)?;
        match adu.split_first() {
            Some((function, data)) => Ok(TcpFrame::new(
                header.tx_id,
                header.unit_id,
                *function,
                data,
            )),
            None => Err(FrameParseError::MissingFunctionCode.into()),
        }
    }
}

impl FrameParser for MbapParser {
    type Output = TcpFrame;

    fn max_frame_size(&self) -> usize {
        constants::MAX_FRAME_LENGTH
    }

    fn parse(
        &mut self,
        cursor: &mut ReadBuffer,
        decode_level: FrameDecodeLevel,
    ) -> Result<Option<TcpFrame>, RequestError> {
        match self.state {
            ParseState::Header(header) => {
                if cursor.len() < header.adu_length {
                    return Ok(None);
                }

                let frame = Self::parse_body(&header, cursor)?;
                self.state = ParseState::Begin;

                if decode_level.enabled() {
                    tracing::info!("MBAP RX - {}", MbapDisplay::new(decode_level, &frame));
                }

                Ok(Some(frame))
            }
            ParseState::Begin => {
                if cursor.len() < constants::HEADER_LENGTH {
                    return Ok(None);
                }

                self.state = ParseState::Header(Self::parse_header(cursor)?);
                self.parse(cursor, decode_level)
            }
        }
    }

    fn reset(&mut self) {
        self.state = ParseState::Begin;
    }
}

struct MbapDisplay<'a> {
    level: FrameDecodeLevel,
    frame: &'a TcpFrame,
}

impl<'a> MbapDisplay<'a> {
    fn new(level: FrameDecodeLevel, frame: &'a TcpFrame) -> Self {
        MbapDisplay { level, frame }
    }
}

impl std::fmt::Display for MbapDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.frame.fmt_header(f)?;
        if self.level.payload_enabled() {
            crate::common::phys::format_bytes(f, &self.frame.to_bytes())?;
        }
        Ok(())
    }
}
