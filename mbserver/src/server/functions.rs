//! Standard function implementations installed in every new dispatch table
//!
//! Addresses are zero-based offsets into the banks. Every write is validated completely
//! before the first cell is modified.

use scursor::ReadCursor;

use crate::common::bits::{num_bytes_for_bits, pack_bits, unpack_bits};
use crate::common::frame::Frame;
use crate::constants::limits;
use crate::exception::ExceptionCode;
use crate::server::memory::{cell_mut, cells, cells_mut, Memory};
use crate::types::{coil_from_u16, AddressRange, Indexed};

pub(crate) fn read_coils(memory: &mut Memory, frame: &dyn Frame) -> Result<Vec<u8>, ExceptionCode> {
    let range = parse_read_request(frame.payload(), limits::MAX_READ_COILS_COUNT)?;
    read_bits(&memory.coils, range)
}

pub(crate) fn read_discrete_inputs(
    memory: &mut Memory,
    frame: &dyn Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let range = parse_read_request(frame.payload(), limits::MAX_READ_COILS_COUNT)?;
    read_bits(&memory.discrete_inputs, range)
}

pub(crate) fn read_holding_registers(
    memory: &mut Memory,
    frame: &dyn Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let range = parse_read_request(frame.payload(), limits::MAX_READ_REGISTERS_COUNT)?;
    read_registers(&memory.holding_registers, range)
}

pub(crate) fn read_input_registers(
    memory: &mut Memory,
    frame: &dyn Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let range = parse_read_request(frame.payload(), limits::MAX_READ_REGISTERS_COUNT)?;
    read_registers(&memory.input_registers, range)
}

pub(crate) fn write_single_coil(
    memory: &mut Memory,
    frame: &dyn Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let request = parse_single_write(frame.payload())?;
    let value = coil_from_u16(request.value)?;
    *cell_mut(&mut memory.coils, request.index)? = value;
    Ok(echo(request.index, request.value))
}

pub(crate) fn write_single_register(
    memory: &mut Memory,
    frame: &dyn Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let request = parse_single_write(frame.payload())?;
    *cell_mut(&mut memory.holding_registers, request.index)? = request.value;
    Ok(echo(request.index, request.value))
}

pub(crate) fn write_multiple_coils(
    memory: &mut Memory,
    frame: &dyn Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let mut cursor = ReadCursor::new(frame.payload());
    let range = AddressRange::parse(&mut cursor, limits::MAX_WRITE_COILS_COUNT)?;
    let values = read_byte_counted(&mut cursor, num_bytes_for_bits(range.count))?;

    let bank = cells_mut(&mut memory.coils, range)?;
    for (cell, value) in bank.iter_mut().zip(unpack_bits(values, range.count)) {
        *cell = value;
    }

    Ok(echo(range.start, range.count))
}

pub(crate) fn write_multiple_registers(
    memory: &mut Memory,
    frame: &dyn Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let mut cursor = ReadCursor::new(frame.payload());
    let range = AddressRange::parse(&mut cursor, limits::MAX_WRITE_REGISTERS_COUNT)?;
    let values = read_byte_counted(&mut cursor, 2 * range.count as usize)?;

    let bank = cells_mut(&mut memory.holding_registers, range)?;
    for (cell, value) in bank.iter_mut().zip(values.chunks_exact(2)) {
        *cell = u16::from_be_bytes([value[0], value[1]]);
    }

    Ok(echo(range.start, range.count))
}

fn parse_read_request(payload: &[u8], max_count: u16) -> Result<AddressRange, ExceptionCode> {
    let mut cursor = ReadCursor::new(payload);
    let range = AddressRange::parse(&mut cursor, max_count)?;
    cursor.expect_empty()?;
    Ok(range)
}

fn parse_single_write(payload: &[u8]) -> Result<Indexed<u16>, ExceptionCode> {
    let mut cursor = ReadCursor::new(payload);
    let index = cursor.read_u16_be()?;
    let value = cursor.read_u16_be()?;
    cursor.expect_empty()?;
    Ok(Indexed::new(index, value))
}

/// byte count followed by exactly that many bytes, which must match what the count requires
fn read_byte_counted<'a>(
    cursor: &mut ReadCursor<'a>,
    expected: usize,
) -> Result<&'a [u8], ExceptionCode> {
    let byte_count = cursor.read_u8()? as usize;
    if byte_count != expected {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let values = cursor.read_bytes(byte_count)?;
    cursor.expect_empty()?;
    Ok(values)
}

fn read_bits(bank: &[bool], range: AddressRange) -> Result<Vec<u8>, ExceptionCode> {
    let bits = pack_bits(cells(bank, range)?);
    let mut response = Vec::with_capacity(1 + bits.len());
    // at most 250 bytes for 2000 bits
    response.push(bits.len() as u8);
    response.extend_from_slice(&bits);
    Ok(response)
}

fn read_registers(bank: &[u16], range: AddressRange) -> Result<Vec<u8>, ExceptionCode> {
    let values = cells(bank, range)?;
    let mut response = Vec::with_capacity(1 + 2 * values.len());
    // at most 250 bytes for 125 registers
    response.push((2 * values.len()) as u8);
    for value in values {
        response.extend_from_slice(&value.to_be_bytes());
    }
    Ok(response)
}

fn echo(first: u16, second: u16) -> Vec<u8> {
    let mut response = Vec::with_capacity(4);
    response.extend_from_slice(&first.to_be_bytes());
    response.extend_from_slice(&second.to_be_bytes());
    response
}

#[cfg(test)]
mod tests {
    use crate::server::memory::BankCapacity;
    use crate::tcp::TcpFrame;
    use crate::types::UnitId;

    use super::*;

    fn request(function: u8, payload: &[u8]) -> TcpFrame {
        TcpFrame::new(0, UnitId::new(1), function, payload)
    }

    fn small_memory() -> Memory {
        Memory::new(BankCapacity::uniform(16))
    }

    #[test]
    fn reads_coils_packed_lsb_first() {
        let mut memory = small_memory();
        memory.coils[1] = true;
        memory.coils[3] = true;
        memory.coils[8] = true;
        let frame = request(0x01, &[0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(read_coils(&mut memory, &frame), Ok(vec![0x02, 0x0A, 0x01]));
    }

    #[test]
    fn reads_discrete_inputs_from_their_own_bank() {
        let mut memory = small_memory();
        memory.coils[0] = true;
        memory.discrete_inputs[2] = true;
        let frame = request(0x02, &[0x00, 0x00, 0x00, 0x03]);
        assert_eq!(read_discrete_inputs(&mut memory, &frame), Ok(vec![0x01, 0x04]));
    }

    #[test]
    fn reads_registers_big_endian() {
        let mut memory = small_memory();
        memory.holding_registers[5] = 0x04D2;
        memory.input_registers[6] = 0xCAFE;
        let frame = request(0x03, &[0x00, 0x05, 0x00, 0x02]);
        assert_eq!(
            read_holding_registers(&mut memory, &frame),
            Ok(vec![0x04, 0x04, 0xD2, 0x00, 0x00])
        );
        assert_eq!(
            read_input_registers(&mut memory, &frame),
            Ok(vec![0x04, 0x00, 0x00, 0xCA, 0xFE])
        );
    }

    #[test]
    fn read_count_limits() {
        let mut memory = Memory::default();
        // 2000 coils is the maximum, 2001 is not
        assert!(read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x07, 0xD0])).is_ok());
        assert_eq!(
            read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x07, 0xD1])),
            Err(ExceptionCode::IllegalDataValue)
        );
        // 125 registers is the maximum, 126 is not
        assert!(
            read_holding_registers(&mut memory, &request(0x03, &[0x00, 0x00, 0x00, 0x7D])).is_ok()
        );
        assert_eq!(
            read_holding_registers(&mut memory, &request(0x03, &[0x00, 0x00, 0x00, 0x7E])),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            read_input_registers(&mut memory, &request(0x04, &[0x00, 0x00, 0x00, 0x00])),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn reads_beyond_capacity_are_illegal_addresses() {
        let mut memory = small_memory();
        assert_eq!(
            read_coils(&mut memory, &request(0x01, &[0x00, 0x0F, 0x00, 0x02])),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            read_holding_registers(&mut memory, &request(0x03, &[0x00, 0x10, 0x00, 0x01])),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn malformed_requests_are_illegal_values() {
        let mut memory = small_memory();
        // truncated
        assert_eq!(
            read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x00])),
            Err(ExceptionCode::IllegalDataValue)
        );
        // trailing bytes
        assert_eq!(
            read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x00, 0x01, 0x00])),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            write_single_register(&mut memory, &request(0x06, &[0x00, 0x01])),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn writes_single_coil_and_echoes_request() {
        let mut memory = small_memory();
        let payload = &[0x00, 0x03, 0xFF, 0x00];
        assert_eq!(
            write_single_coil(&mut memory, &request(0x05, payload)),
            Ok(payload.to_vec())
        );
        assert!(memory.coils[3]);

        let payload = &[0x00, 0x03, 0x00, 0x00];
        assert_eq!(
            write_single_coil(&mut memory, &request(0x05, payload)),
            Ok(payload.to_vec())
        );
        assert!(!memory.coils[3]);
    }

    #[test]
    fn rejects_invalid_coil_value() {
        let mut memory = small_memory();
        assert_eq!(
            write_single_coil(&mut memory, &request(0x05, &[0x00, 0x03, 0x00, 0x01])),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert!(!memory.coils[3]);
    }

    #[test]
    fn writes_single_register() {
        let mut memory = small_memory();
        let payload = &[0x00, 0x05, 0x04, 0xD2];
        assert_eq!(
            write_single_register(&mut memory, &request(0x06, payload)),
            Ok(payload.to_vec())
        );
        assert_eq!(memory.holding_registers[5], 1234);
        assert_eq!(
            write_single_register(&mut memory, &request(0x06, &[0x00, 0x10, 0x00, 0x01])),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn writes_multiple_coils() {
        let mut memory = small_memory();
        let frame = request(0x0F, &[0x00, 0x02, 0x00, 0x0A, 0x02, 0xCD, 0x01]);
        assert_eq!(
            write_multiple_coils(&mut memory, &frame),
            Ok(vec![0x00, 0x02, 0x00, 0x0A])
        );
        assert_eq!(
            &memory.coils[0..13],
            &[
                false, false, // untouched
                true, false, true, true, false, false, true, true, // 0xCD
                true, false, // 0x01
                false, // untouched
            ]
        );
    }

    #[test]
    fn write_multiple_coils_checks_byte_count() {
        let mut memory = small_memory();
        let frame = request(0x0F, &[0x00, 0x00, 0x00, 0x0A, 0x01, 0xFF]);
        assert_eq!(
            write_multiple_coils(&mut memory, &frame),
            Err(ExceptionCode::IllegalDataValue)
        );
        let frame = request(0x0F, &[0x00, 0x00, 0x00, 0x0A, 0x02, 0xFF]);
        assert_eq!(
            write_multiple_coils(&mut memory, &frame),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert!(memory.coils.iter().all(|x| !*x));
    }

    #[test]
    fn writes_multiple_registers() {
        let mut memory = small_memory();
        let frame = request(0x10, &[0x00, 0x01, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(
            write_multiple_registers(&mut memory, &frame),
            Ok(vec![0x00, 0x01, 0x00, 0x02])
        );
        assert_eq!(&memory.holding_registers[0..4], &[0, 0x1234, 0x5678, 0]);
    }

    #[test]
    fn failed_multiple_write_leaves_memory_untouched() {
        let mut memory = small_memory();
        // extends one register past the end of the bank
        let frame = request(0x10, &[0x00, 0x0F, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(
            write_multiple_registers(&mut memory, &frame),
            Err(ExceptionCode::IllegalDataAddress)
        );
        // byte count disagrees with the count
        let frame = request(0x10, &[0x00, 0x00, 0x00, 0x02, 0x02, 0x12, 0x34]);
        assert_eq!(
            write_multiple_registers(&mut memory, &frame),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert!(memory.holding_registers.iter().all(|x| *x == 0));
    }

    #[test]
    fn write_count_limits() {
        let mut memory = Memory::default();
        // 124 registers exceeds the maximum of 123
        let mut payload = vec![0x00, 0x00, 0x00, 0x7C, 0xF8];
        payload.extend_from_slice(&[0u8; 248]);
        assert_eq!(
            write_multiple_registers(&mut memory, &request(0x10, &payload)),
            Err(ExceptionCode::IllegalDataValue)
        );
    }
}
