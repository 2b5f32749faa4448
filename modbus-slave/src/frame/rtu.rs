use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Duration;

use crate::common::phys::PhysDisplay;
use crate::decode::{FrameDecodeLevel, PhysDecodeLevel};
use crate::error::{FrameParseError, SessionError};

pub(crate) mod constants {
    pub(crate) const HEADER_LENGTH: usize = 1;
    pub(crate) const FUNCTION_CODE_LENGTH: usize = 1;
    pub(crate) const CRC_LENGTH: usize = 2;
    pub(crate) const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + FUNCTION_CODE_LENGTH + CRC_LENGTH;
    pub(crate) const MAX_FRAME_LENGTH: usize =
        HEADER_LENGTH + crate::frame::constants::MAX_PDU_LENGTH + CRC_LENGTH;
}

/// precomputes the CRC table as a constant!
const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// Frame with RTU framing, as carried over a serial line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtuFrame {
    unit_id: u8,
    function: u8,
    data: Vec<u8>,
}

impl RtuFrame {
    /// Construct a frame from its fields
    ///
    /// Fails if the payload doesn't fit in a single RTU frame.
    pub fn new(unit_id: u8, function: u8, data: Vec<u8>) -> Result<Self, FrameParseError> {
        check_data_length(&data)?;
        Ok(Self {
            unit_id,
            function,
            data,
        })
    }

    /// Decode a frame that occupies all of `bytes` and check its trailing CRC
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameParseError> {
        if bytes.len() < constants::MIN_FRAME_LENGTH {
            return Err(FrameParseError::FrameTooShort(
                bytes.len(),
                constants::MIN_FRAME_LENGTH,
            ));
        }
        if bytes.len() > constants::MAX_FRAME_LENGTH {
            return Err(FrameParseError::FrameLengthTooBig(
                bytes.len(),
                constants::MAX_FRAME_LENGTH,
            ));
        }

        let (body, crc) = bytes.split_at(bytes.len() - constants::CRC_LENGTH);
        let received_crc = u16::from_le_bytes([crc[0], crc[1]]);
        let expected_crc = CRC.checksum(body);
        if received_crc != expected_crc {
            return Err(FrameParseError::CrcValidationFailure(
                received_crc,
                expected_crc,
            ));
        }

        Ok(Self {
            unit_id: body[0],
            function: body[1],
            data: body[constants::HEADER_LENGTH + constants::FUNCTION_CODE_LENGTH..].to_vec(),
        })
    }

    /// Unit identifier
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Raw function code
    pub fn function(&self) -> u8 {
        self.function
    }

    /// Payload following the function code
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// CRC over the unit id, function code and payload
    pub fn crc(&self) -> u16 {
        let mut digest = CRC.digest();
        digest.update(&[self.unit_id, self.function]);
        digest.update(&self.data);
        digest.finalize()
    }

    pub(crate) fn set_data(&mut self, data: Vec<u8>) -> Result<(), FrameParseError> {
        check_data_length(&data)?;
        self.data = data;
        Ok(())
    }

    pub(crate) fn set_exception(&mut self, function: u8, code: u8) {
        self.function = function;
        self.data = vec![code];
    }

    /// Serialize with a freshly computed CRC appended
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(constants::MIN_FRAME_LENGTH + self.data.len());
        bytes.push(self.unit_id);
        bytes.push(self.function);
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&self.crc().to_le_bytes());
        bytes
    }
}

fn check_data_length(data: &[u8]) -> Result<(), FrameParseError> {
    if data.len() > crate::frame::constants::MAX_DATA_LENGTH {
        return Err(FrameParseError::FrameLengthTooBig(
            constants::MIN_FRAME_LENGTH + data.len(),
            constants::MAX_FRAME_LENGTH,
        ));
    }
    Ok(())
}

/// Read the bytes of one frame from a serial line
///
/// The first read waits indefinitely. The frame ends once the line has been silent for
/// `silence` or the maximum frame size has been buffered.
pub(crate) async fn read_frame<T>(
    io: &mut T,
    silence: Duration,
    level: PhysDecodeLevel,
) -> Result<Vec<u8>, SessionError>
where
    T: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; constants::MAX_FRAME_LENGTH];

    let mut length = io.read(&mut buffer).await?;
    if length == 0 {
        return Err(SessionError::Disconnected);
    }

    while length < constants::MAX_FRAME_LENGTH {
        match tokio::time::timeout(silence, io.read(&mut buffer[length..])).await {
            // end of frame
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(count)) => length += count,
            Ok(Err(err)) => return Err(err.into()),
        }
    }

    buffer.truncate(length);

    if level.enabled() {
        tracing::info!("PHYS RX - {}", PhysDisplay::new(level, &buffer));
    }

    Ok(buffer)
}

pub(crate) struct RtuDisplay<'a> {
    level: FrameDecodeLevel,
    frame: &'a RtuFrame,
}

impl<'a> RtuDisplay<'a> {
    pub(crate) fn new(level: FrameDecodeLevel, frame: &'a RtuFrame) -> Self {
        RtuDisplay { level, frame }
    }
}

impl std::fmt::Display for RtuDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "unit: {:#04X} crc: {:#06X} (payload len = {})",
            self.frame.unit_id,
            self.frame.crc(),
            self.frame.data.len(),
        )?;
        if self.level.payload_enabled() {
            crate::common::phys::format_bytes(f, &self.frame.data)?;
        }
        Ok(())
    }
}
