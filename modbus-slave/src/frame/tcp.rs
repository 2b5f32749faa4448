use scursor::ReadCursor;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::phys::PhysDisplay;
use crate::decode::{DecodeLevel, FrameDecodeLevel};
use crate::error::{FrameParseError, SessionError};
use crate::frame::constants::MAX_PDU_LENGTH;

pub(crate) mod constants {
    pub(crate) const HEADER_LENGTH: usize = 7;
    /// header + function code
    pub(crate) const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + 1;
    pub(crate) const MAX_FRAME_LENGTH: usize =
        HEADER_LENGTH + crate::frame::constants::MAX_PDU_LENGTH;
    /// unit id + function code
    pub(crate) const MIN_LENGTH_FIELD: usize = 2;
    /// includes the 1 byte unit id
    pub(crate) const MAX_LENGTH_FIELD: usize = crate::frame::constants::MAX_PDU_LENGTH + 1;
}

/// Frame with an MBAP header, as carried over TCP and TLS
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpFrame {
    transaction_id: u16,
    unit_id: u8,
    function: u8,
    data: Vec<u8>,
}

impl TcpFrame {
    /// Construct a frame from its fields
    ///
    /// Fails if the payload doesn't fit in a single MBAP frame.
    pub fn new(
        transaction_id: u16,
        unit_id: u8,
        function: u8,
        data: Vec<u8>,
    ) -> Result<Self, FrameParseError> {
        check_data_length(&data)?;
        Ok(Self {
            transaction_id,
            unit_id,
            function,
            data,
        })
    }

    /// Decode a frame that occupies all of `bytes`
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

        let mut cursor = ReadCursor::new(bytes);
        let too_short =
            |_| FrameParseError::FrameTooShort(bytes.len(), constants::MIN_FRAME_LENGTH);

        let transaction_id = cursor.read_u16_be().map_err(too_short)?;
        let protocol_id = cursor.read_u16_be().map_err(too_short)?;
        let length = cursor.read_u16_be().map_err(too_short)? as usize;

        if protocol_id != 0 {
            return Err(FrameParseError::UnknownProtocolId(protocol_id));
        }

        // the length field counts the unit id and everything after it
        let actual = bytes.len() - (constants::HEADER_LENGTH - 1);
        if length != actual {
            return Err(FrameParseError::MbapLengthMismatch(length, actual));
        }

        let unit_id = cursor.read_u8().map_err(too_short)?;
        let function = cursor.read_u8().map_err(too_short)?;
        let data = bytes[constants::MIN_FRAME_LENGTH..].to_vec();

        Ok(Self {
            transaction_id,
            unit_id,
            function,
            data,
        })
    }

    /// Transaction identifier echoed by the response
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
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

    /// Value of the MBAP length field for the current payload
    pub fn length(&self) -> u16 {
        // bounded by MAX_LENGTH_FIELD
        (self.data.len() + constants::MIN_LENGTH_FIELD) as u16
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

    /// Serialize with a length field computed from the current payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(constants::MIN_FRAME_LENGTH + self.data.len());
        bytes.extend_from_slice(&self.transaction_id.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x00]);
        bytes.extend_from_slice(&self.length().to_be_bytes());
        bytes.push(self.unit_id);
        bytes.push(self.function);
        bytes.extend_from_slice(&self.data);
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

/// Read exactly one MBAP frame from a stream
///
/// The header is read first and its length field determines how many more bytes belong to
/// the frame, so segmented or coalesced TCP reads never split or merge frames.
pub(crate) async fn read_frame<T>(io: &mut T, decode: DecodeLevel) -> Result<TcpFrame, SessionError>
where
    T: AsyncRead + Unpin,
{
    let mut header = [0u8; constants::HEADER_LENGTH];
    io.read_exact(&mut header).await?;

    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;

    if protocol_id != 0 {
        return Err(FrameParseError::UnknownProtocolId(protocol_id).into());
    }
    if length < constants::MIN_LENGTH_FIELD {
        return Err(FrameParseError::MbapLengthTooSmall(length).into());
    }
    if length > constants::MAX_LENGTH_FIELD {
        return Err(FrameParseError::MbapLengthTooBig(length, constants::MAX_LENGTH_FIELD).into());
    }

    // the unit id is the last byte of the header
    let mut bytes = vec![0u8; constants::HEADER_LENGTH + length - 1];
    bytes[..constants::HEADER_LENGTH].copy_from_slice(&header);
    io.read_exact(&mut bytes[constants::HEADER_LENGTH..]).await?;

    if decode.physical.enabled() {
        tracing::info!("PHYS RX - {}", PhysDisplay::new(decode.physical, &bytes));
    }

    let frame = TcpFrame::parse(&bytes)?;

    if decode.frame.enabled() {
        tracing::info!("MBAP RX - {}", MbapDisplay::new(decode.frame, &frame));
    }

    Ok(frame)
}

pub(crate) struct MbapDisplay<'a> {
    level: FrameDecodeLevel,
    frame: &'a TcpFrame,
}

impl<'a> MbapDisplay<'a> {
    pub(crate) fn new(level: FrameDecodeLevel, frame: &'a TcpFrame) -> Self {
        MbapDisplay { level, frame }
    }
}

impl std::fmt::Display for MbapDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "tx_id: {:#06X} unit: {:#04X} len: {} (pdu len = {})",
            self.frame.transaction_id,
            self.frame.unit_id,
            self.frame.length(),
            self.frame.data.len() + 1,
        )?;
        if self.level.payload_enabled() {
            let mut pdu = Vec::with_capacity(MAX_PDU_LENGTH);
            pdu.push(self.frame.function);
            pdu.extend_from_slice(&self.frame.data);
            crate::common::phys::format_bytes(f, &pdu)?;
        }
        Ok(())
    }
}
