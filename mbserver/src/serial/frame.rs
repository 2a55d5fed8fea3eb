use crate::common::buffer::ReadBuffer;
use crate::common::frame::{Frame, FrameParser};
use crate::common::function::FunctionCode;
use crate::constants::function::ERROR_MASK;
use crate::decode::FrameDecodeLevel;
use crate::error::{FrameParseError, RequestError};
use crate::exception::ExceptionCode;
use crate::types::UnitId;

pub(crate) mod constants {
    pub(crate) const HEADER_LENGTH: usize = 1;
    pub(crate) const FUNCTION_CODE_LENGTH: usize = 1;
    pub(crate) const CRC_LENGTH: usize = 2;
    pub(crate) const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + FUNCTION_CODE_LENGTH + CRC_LENGTH;
    pub(crate) const MAX_FRAME_LENGTH: usize =
        HEADER_LENGTH + crate::common::frame::constants::MAX_PDU_LENGTH + CRC_LENGTH;
}

/// precomputes the CRC table as a constant!
const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// A Modbus RTU frame: unit id, PDU and CRC-16
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtuFrame {
    unit_id: UnitId,
    function: u8,
    data: Vec<u8>,
}

impl RtuFrame {
    /// Create a frame from its fields. The CRC is calculated when the frame is serialized.
    pub fn new(unit_id: UnitId, function: u8, data: &[u8]) -> Self {
        Self {
            unit_id,
            function,
            data: data.to_vec(),
        }
    }

    fn crc(&self) -> u16 {
        let mut digest = CRC.digest();
        digest.update(&[self.unit_id.value, self.function]);
        digest.update(&self.data);
        digest.finalize()
    }
}

impl Frame for RtuFrame {
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
        let mut bytes = Vec::with_capacity(constants::MIN_FRAME_LENGTH + self.data.len());
        bytes.push(self.unit_id.value);
        bytes.push(self.function);
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&self.crc().to_le_bytes());
        bytes
    }

    fn fmt_header(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "RTU dest: {} crc: {:#06X} (payload len = {})",
            self.unit_id,
            self.crc(),
            self.data.len() + constants::FUNCTION_CODE_LENGTH
        )
    }
}

#[derive(Clone, Copy)]
enum ParseState {
    Start,
    ReadFullBody(UnitId, usize), // unit_id, length of rest
    ReadToOffsetForLength(UnitId, usize), // unit_id, length to length
}

#[derive(Clone, Copy)]
enum LengthMode {
    /// The length is always the same (without function code)
    Fixed(usize),
    /// You need to read X more bytes. The last byte contains the number of extra bytes to read after that
    Offset(usize),
    /// Non-standard function code, the frame extends to the end of what has been received
    Unknown,
}

pub(crate) struct RtuParser {
    state: ParseState,
}

impl RtuParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::Start,
        }
    }

    // Returns how to calculate the length of the body of a request
    fn length_mode(function_code: u8) -> LengthMode {
        match FunctionCode::get(function_code) {
            Some(FunctionCode::ReadCoils)
            | Some(FunctionCode::ReadDiscreteInputs)
            | Some(FunctionCode::ReadHoldingRegisters)
            | Some(FunctionCode::ReadInputRegisters)
            | Some(FunctionCode::WriteSingleCoil)
            | Some(FunctionCode::WriteSingleRegister) => LengthMode::Fixed(4),
            Some(FunctionCode::WriteMultipleCoils) | Some(FunctionCode::WriteMultipleRegisters) => {
                LengthMode::Offset(5)
            }
            None => LengthMode::Unknown,
        }
    }
}

impl FrameParser for RtuParser {
    type Output = RtuFrame;

    fn max_frame_size(&self) -> usize {
        constants::MAX_FRAME_LENGTH
    }

    fn parse(
        &mut self,
        cursor: &mut ReadBuffer,
        decode_level: FrameDecodeLevel,
    ) -> Result<Option<RtuFrame>, RequestError> {
        match self.state {
            ParseState::Start => {
                if cursor.len() < 2 {
                    return Ok(None);
                }

                // We don't consume the function code to avoid an unnecessary copy of the receive buffer later on
                let raw_function_code = cursor.peek_at(1)?;
                let mode = Self::length_mode(raw_function_code);

                if let LengthMode::Unknown = mode {
                    if cursor.len() < constants::MIN_FRAME_LENGTH {
                        return Ok(None);
                    }
                }

                let unit_id = UnitId::new(cursor.read_u8()?);

                if unit_id.is_rtu_reserved() {
                    tracing::warn!(
                        "received reserved unit ID {}, violating the Modbus RTU standard. Passing it through nevertheless.",
                        unit_id
                    );
                }

                self.state = match mode {
                    LengthMode::Fixed(length) => ParseState::ReadFullBody(unit_id, length),
                    LengthMode::Offset(offset) => {
                        ParseState::ReadToOffsetForLength(unit_id, offset)
                    }
                    // everything received so far except the function code and the CRC
                    LengthMode::Unknown => ParseState::ReadFullBody(
                        unit_id,
                        cursor.len() - constants::FUNCTION_CODE_LENGTH - constants::CRC_LENGTH,
                    ),
                };

                self.parse(cursor, decode_level)
            }
            ParseState::ReadToOffsetForLength(unit_id, offset) => {
                if cursor.len() < constants::FUNCTION_CODE_LENGTH + offset {
                    return Ok(None);
                }

                // Get the complete size
                let extra_bytes_to_read =
                    cursor.peek_at(constants::FUNCTION_CODE_LENGTH + offset - 1)? as usize;
                self.state = ParseState::ReadFullBody(unit_id, offset + extra_bytes_to_read);

                self.parse(cursor, decode_level)
            }
            ParseState::ReadFullBody(unit_id, length) => {
                if constants::FUNCTION_CODE_LENGTH + length
                    > crate::common::frame::constants::MAX_PDU_LENGTH
                {
                    self.state = ParseState::Start;
                    return Err(FrameParseError::FrameLengthTooBig(
                        constants::FUNCTION_CODE_LENGTH + length,
                        crate::common::frame::constants::MAX_PDU_LENGTH,
                    )
                    .into());
                }

                if cursor.len() < constants::FUNCTION_CODE_LENGTH + length + constants::CRC_LENGTH {
                    return Ok(None);
                }

                let frame = {
                    let pdu = cursor.read(constants::FUNCTION_CODE_LENGTH + length)?;
                    match pdu.split_first() {
                        Some((function, data)) => RtuFrame::new(unit_id, *function, data),
                        None => {
                            self.state = ParseState::Start;
                            return Err(FrameParseError::FrameLengthTooSmall(
                                constants::HEADER_LENGTH,
                            )
                            .into());
                        }
                    }
                };
                let received_crc = cursor.read_u16_le()?;
                self.state = ParseState::Start;

                // Check CRC
                let expected_crc = frame.crc();
                if received_crc != expected_crc {
                    return Err(
                        FrameParseError::CrcValidationFailure(received_crc, expected_crc).into(),
                    );
                }

                if decode_level.enabled() {
                    tracing::info!("RTU RX - {}", RtuDisplay::new(decode_level, &frame));
                }

                Ok(Some(frame))
            }
        }
    }

    fn reset(&mut self) {
        self.state = ParseState::Start;
    }
}

struct RtuDisplay<'a> {
    level: FrameDecodeLevel,
    frame: &'a RtuFrame,
}

impl<'a> RtuDisplay<'a> {
    fn new(level: FrameDecodeLevel, frame: &'a RtuFrame) -> Self {
        RtuDisplay { level, frame }
    }
}

impl std::fmt::Display for RtuDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.frame.fmt_header(f)?;
        if self.level.payload_enabled() {
            crate::common::phys::format_bytes(f, &self.frame.to_bytes())?;
        }
        Ok(())
    }
}
