use scursor::ReadCursor;

use crate::common::bits::{get_bit, num_bytes_for_bits, pack_bits};
use crate::constants::{coil, limits};
use crate::exception::ExceptionCode;
use crate::frame::Frame;
use crate::server::memory::Memory;
use crate::types::AddressRange;

// any payload that can't be decoded is an illegal value
fn malformed<E>(_: E) -> ExceptionCode {
    ExceptionCode::IllegalDataValue
}

fn parse_range(data: &[u8], max_count: u16) -> Result<AddressRange, ExceptionCode> {
    let mut cursor = ReadCursor::new(data);
    let start = cursor.read_u16_be().map_err(malformed)?;
    let count = cursor.read_u16_be().map_err(malformed)?;
    cursor.expect_empty().map_err(malformed)?;
    AddressRange::try_from(start, count, max_count)
}

fn parse_indexed(data: &[u8]) -> Result<(u16, u16), ExceptionCode> {
    let mut cursor = ReadCursor::new(data);
    let index = cursor.read_u16_be().map_err(malformed)?;
    let value = cursor.read_u16_be().map_err(malformed)?;
    cursor.expect_empty().map_err(malformed)?;
    Ok((index, value))
}

/// start, count, byte count and then exactly `byte count` bytes of values
fn parse_write_multiple(data: &[u8]) -> Result<(u16, u16, &[u8]), ExceptionCode> {
    const HEADER_LENGTH: usize = 5;

    let mut cursor = ReadCursor::new(data);
    let start = cursor.read_u16_be().map_err(malformed)?;
    let count = cursor.read_u16_be().map_err(malformed)?;
    let byte_count = cursor.read_u8().map_err(malformed)? as usize;
    if cursor.remaining() != byte_count {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((start, count, &data[HEADER_LENGTH..]))
}

fn read_bits(table: &[bool], frame: &Frame) -> Result<Vec<u8>, ExceptionCode> {
    let range = parse_range(frame.data(), limits::MAX_READ_COILS_COUNT)?;
    let bits = table
        .get(range.to_std_range())
        .ok_or(ExceptionCode::IllegalDataAddress)?;

    let packed = pack_bits(bits);
    let mut response = Vec::with_capacity(1 + packed.len());
    response.push(packed.len() as u8);
    response.extend_from_slice(&packed);
    Ok(response)
}

fn read_registers(table: &[u16], frame: &Frame) -> Result<Vec<u8>, ExceptionCode> {
    let range = parse_range(frame.data(), limits::MAX_READ_REGISTERS_COUNT)?;
    let registers = table
        .get(range.to_std_range())
        .ok_or(ExceptionCode::IllegalDataAddress)?;

    let mut response = Vec::with_capacity(1 + 2 * registers.len());
    response.push((2 * registers.len()) as u8);
    for value in registers {
        response.extend_from_slice(&value.to_be_bytes());
    }
    Ok(response)
}

pub(crate) fn read_coils(memory: &mut Memory, frame: &Frame) -> Result<Vec<u8>, ExceptionCode> {
    read_bits(memory.coils(), frame)
}

pub(crate) fn read_discrete_inputs(
    memory: &mut Memory,
    frame: &Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    read_bits(memory.discrete_inputs(), frame)
}

pub(crate) fn read_holding_registers(
    memory: &mut Memory,
    frame: &Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    read_registers(memory.holding_registers(), frame)
}

pub(crate) fn read_input_registers(
    memory: &mut Memory,
    frame: &Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    read_registers(memory.input_registers(), frame)
}

pub(crate) fn write_single_coil(
    memory: &mut Memory,
    frame: &Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let (index, value) = parse_indexed(frame.data())?;
    let value = match value {
        coil::ON => true,
        coil::OFF => false,
        _ => return Err(ExceptionCode::IllegalDataValue),
    };

    let slot = memory
        .coils_mut()
        .get_mut(index as usize)
        .ok_or(ExceptionCode::IllegalDataAddress)?;
    *slot = value;

    Ok(frame.data().to_vec())
}

pub(crate) fn write_single_register(
    memory: &mut Memory,
    frame: &Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let (index, value) = parse_indexed(frame.data())?;

    let slot = memory
        .holding_registers_mut()
        .get_mut(index as usize)
        .ok_or(ExceptionCode::IllegalDataAddress)?;
    *slot = value;

    Ok(frame.data().to_vec())
}

pub(crate) fn write_multiple_coils(
    memory: &mut Memory,
    frame: &Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let (start, count, values) = parse_write_multiple(frame.data())?;
    let range = AddressRange::try_from(start, count, limits::MAX_WRITE_COILS_COUNT)?;
    if values.len() != num_bytes_for_bits(count) {
        return Err(ExceptionCode::IllegalDataValue);
    }

    let coils = memory
        .coils_mut()
        .get_mut(range.to_std_range())
        .ok_or(ExceptionCode::IllegalDataAddress)?;
    for (i, coil) in coils.iter_mut().enumerate() {
        *coil = get_bit(values, i);
    }

    Ok(echo_range(range))
}

pub(crate) fn write_multiple_registers(
    memory: &mut Memory,
    frame: &Frame,
) -> Result<Vec<u8>, ExceptionCode> {
    let (start, count, values) = parse_write_multiple(frame.data())?;
    let range = AddressRange::try_from(start, count, limits::MAX_WRITE_REGISTERS_COUNT)?;
    if values.len() != 2 * count as usize {
        return Err(ExceptionCode::IllegalDataValue);
    }

    let registers = memory
        .holding_registers_mut()
        .get_mut(range.to_std_range())
        .ok_or(ExceptionCode::IllegalDataAddress)?;
    for (register, bytes) in registers.iter_mut().zip(values.chunks_exact(2)) {
        *register = u16::from_be_bytes([bytes[0], bytes[1]]);
    }

    Ok(echo_range(range))
}

fn echo_range(range: AddressRange) -> Vec<u8> {
    let mut response = Vec::with_capacity(4);
    response.extend_from_slice(&range.start.to_be_bytes());
    response.extend_from_slice(&range.count.to_be_bytes());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RtuFrame;

    fn request(function: u8, data: &[u8]) -> Frame {
        Frame::Rtu(RtuFrame::new(0x2A, function, data.to_vec()).unwrap())
    }

    #[test]
    fn reads_packed_coils() {
        let mut memory = Memory::new();
        for (i, value) in [true, false, true, true, false, false, true, true, true]
            .iter()
            .enumerate()
        {
            memory.coils_mut()[0x10 + i] = *value;
        }

        let result = read_coils(&mut memory, &request(0x01, &[0x00, 0x10, 0x00, 0x09]));
        assert_eq!(result, Ok(vec![0x02, 0xCD, 0x01]));
    }

    #[test]
    fn reads_eight_zero_coils_from_fresh_memory() {
        let mut memory = Memory::new();
        let result = read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x00, 0x08]));
        assert_eq!(result, Ok(vec![0x01, 0x00]));
    }

    #[test]
    fn reads_discrete_inputs_up_to_the_last_address() {
        let mut memory = Memory::new();
        memory.discrete_inputs_mut()[0xFFFF] = true;
        let result =
            read_discrete_inputs(&mut memory, &request(0x02, &[0xFF, 0xFE, 0x00, 0x02]));
        assert_eq!(result, Ok(vec![0x01, 0x02]));
    }

    #[test]
    fn reads_registers_big_endian() {
        let mut memory = Memory::new();
        memory.holding_registers_mut()[0x10..0x13].copy_from_slice(&[0x1234, 0x5678, 0x2345]);
        memory.input_registers_mut()[0x10] = 0xCAFE;

        let result =
            read_holding_registers(&mut memory, &request(0x03, &[0x00, 0x10, 0x00, 0x03]));
        assert_eq!(
            result,
            Ok(vec![0x06, 0x12, 0x34, 0x56, 0x78, 0x23, 0x45])
        );

        let result = read_input_registers(&mut memory, &request(0x04, &[0x00, 0x10, 0x00, 0x01]));
        assert_eq!(result, Ok(vec![0x02, 0xCA, 0xFE]));
    }

    #[test]
    fn read_past_end_of_address_space_is_illegal_address() {
        let mut memory = Memory::new();
        let result = read_coils(&mut memory, &request(0x01, &[0xFF, 0xFF, 0x00, 0x02]));
        assert_eq!(result, Err(ExceptionCode::IllegalDataAddress));
        let result =
            read_holding_registers(&mut memory, &request(0x03, &[0xFF, 0xFF, 0x00, 0x02]));
        assert_eq!(result, Err(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn read_quantity_limits_are_enforced() {
        let mut memory = Memory::new();
        // 2000 coils is the maximum
        assert!(read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x07, 0xD0])).is_ok());
        assert_eq!(
            read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x07, 0xD1])),
            Err(ExceptionCode::IllegalDataValue)
        );
        // 125 registers is the maximum
        assert!(
            read_input_registers(&mut memory, &request(0x04, &[0x00, 0x00, 0x00, 0x7D])).is_ok()
        );
        assert_eq!(
            read_input_registers(&mut memory, &request(0x04, &[0x00, 0x00, 0x00, 0x7E])),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x00, 0x00])),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn malformed_payload_is_illegal_value() {
        let mut memory = Memory::new();
        assert_eq!(
            read_coils(&mut memory, &request(0x01, &[0x00, 0x00, 0x00])),
            Err(ExceptionCode::IllegalDataValue)
        );
        // trailing byte is checked before the address range
        assert_eq!(
            read_coils(&mut memory, &request(0x01, &[0xFF, 0xFF, 0x00, 0x02, 0x00])),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn writes_single_coil_and_echoes_request() {
        let mut memory = Memory::new();
        let data = [0x00, 0x10, 0xFF, 0x00];
        assert_eq!(
            write_single_coil(&mut memory, &request(0x05, &data)),
            Ok(data.to_vec())
        );
        assert!(memory.coils()[0x10]);

        let data = [0x00, 0x10, 0x00, 0x00];
        assert_eq!(
            write_single_coil(&mut memory, &request(0x05, &data)),
            Ok(data.to_vec())
        );
        assert!(!memory.coils()[0x10]);
    }

    #[test]
    fn rejects_unknown_coil_state() {
        let mut memory = Memory::new();
        assert_eq!(
            write_single_coil(&mut memory, &request(0x05, &[0x00, 0x01, 0xAB, 0xCD])),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert!(!memory.coils()[0x01]);
    }

    #[test]
    fn writes_single_register() {
        let mut memory = Memory::new();
        let data = [0xFF, 0xFF, 0x12, 0x34];
        assert_eq!(
            write_single_register(&mut memory, &request(0x06, &data)),
            Ok(data.to_vec())
        );
        assert_eq!(memory.holding_registers()[0xFFFF], 0x1234);
    }

    #[test]
    fn writes_multiple_coils() {
        let mut memory = Memory::new();
        let result = write_multiple_coils(
            &mut memory,
            &request(0x0F, &[0x00, 0x10, 0x00, 0x0A, 0x02, 0x12, 0x34]),
        );
        assert_eq!(result, Ok(vec![0x00, 0x10, 0x00, 0x0A]));

        let written: Vec<bool> = memory.coils()[0x10..0x1A].to_vec();
        assert_eq!(
            written,
            vec![false, true, false, false, true, false, false, false, false, false]
        );
        // bits beyond the quantity are not written
        assert!(!memory.coils()[0x1C]);
    }

    #[test]
    fn write_multiple_coils_byte_count_must_match_quantity() {
        let mut memory = Memory::new();
        assert_eq!(
            write_multiple_coils(&mut memory, &request(0x0F, &[0x00, 0x10, 0x00, 0x09, 0x01, 0xFF])),
            Err(ExceptionCode::IllegalDataValue)
        );
        // byte count that disagrees with the bytes that follow
        assert_eq!(
            write_multiple_coils(&mut memory, &request(0x0F, &[0x00, 0x10, 0x00, 0x08, 0x02, 0xFF])),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn writes_multiple_registers() {
        let mut memory = Memory::new();
        let result = write_multiple_registers(
            &mut memory,
            &request(0x10, &[0x00, 0x10, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]),
        );
        assert_eq!(result, Ok(vec![0x00, 0x10, 0x00, 0x02]));
        assert_eq!(&memory.holding_registers()[0x10..0x12], &[0x1234, 0x5678]);
    }

    #[test]
    fn write_multiple_registers_past_the_end_is_illegal_address() {
        let mut memory = Memory::new();
        assert_eq!(
            write_multiple_registers(
                &mut memory,
                &request(0x10, &[0xFF, 0xFF, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]),
            ),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(memory.holding_registers()[0xFFFF], 0);
    }

    #[test]
    fn write_multiple_registers_quantity_limit_is_enforced() {
        let mut memory = Memory::new();
        let mut data = vec![0x00, 0x00, 0x00, 0x7C, 0xF8];
        data.extend(std::iter::repeat(0xAB).take(0xF8));
        assert_eq!(
            write_multiple_registers(&mut memory, &request(0x10, &data)),
            Err(ExceptionCode::IllegalDataValue)
        );
    }
}
