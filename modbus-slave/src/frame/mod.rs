use crate::constants::function;
use crate::decode::{AppDecodeLevel, FrameDecodeLevel};
use crate::error::FrameParseError;
use crate::exception::ExceptionCode;

pub(crate) mod rtu;
pub(crate) mod tcp;

pub use rtu::RtuFrame;
pub use tcp::TcpFrame;

pub(crate) mod constants {
    /// function code + payload
    pub(crate) const MAX_PDU_LENGTH: usize = 253;
    /// payload only
    pub(crate) const MAX_DATA_LENGTH: usize = MAX_PDU_LENGTH - 1;
}

/// A Modbus request or response in one of the two wire encapsulations
///
/// A response is derived from its request with `clone()`, which is a deep copy, followed by
/// [`Frame::set_data`] or [`Frame::set_exception`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// MBAP framing used on TCP and TLS
    Tcp(TcpFrame),
    /// RTU framing used on serial lines
    Rtu(RtuFrame),
}

impl Frame {
    /// Decode an MBAP frame from exactly the bytes of one frame
    pub fn parse_tcp(bytes: &[u8]) -> Result<Self, FrameParseError> {
        Ok(Frame::Tcp(TcpFrame::parse(bytes)?))
    }

    /// Decode an RTU frame from exactly the bytes of one frame, validating the CRC
    pub fn parse_rtu(bytes: &[u8]) -> Result<Self, FrameParseError> {
        Ok(Frame::Rtu(RtuFrame::parse(bytes)?))
    }

    /// Unit identifier of the frame
    pub fn unit_id(&self) -> u8 {
        match self {
            Frame::Tcp(x) => x.unit_id(),
            Frame::Rtu(x) => x.unit_id(),
        }
    }

    /// Raw function code, including the exception bit on an exception response
    pub fn function(&self) -> u8 {
        match self {
            Frame::Tcp(x) => x.function(),
            Frame::Rtu(x) => x.function(),
        }
    }

    /// Payload following the function code
    pub fn data(&self) -> &[u8] {
        match self {
            Frame::Tcp(x) => x.data(),
            Frame::Rtu(x) => x.data(),
        }
    }

    /// MBAP transaction identifier, `None` for RTU frames
    pub fn transaction_id(&self) -> Option<u16> {
        match self {
            Frame::Tcp(x) => Some(x.transaction_id()),
            Frame::Rtu(_) => None,
        }
    }

    /// Replace the payload
    ///
    /// The MBAP length or the RTU CRC is recomputed when the frame is serialized. A payload
    /// longer than 252 bytes cannot be carried by either encapsulation and is rejected,
    /// leaving the frame unchanged.
    pub fn set_data(&mut self, data: Vec<u8>) -> Result<(), FrameParseError> {
        match self {
            Frame::Tcp(x) => x.set_data(data),
            Frame::Rtu(x) => x.set_data(data),
        }
    }

    /// Turn the frame into an exception response
    ///
    /// The function code gets the exception bit and the payload becomes the single code byte.
    pub fn set_exception(&mut self, ex: ExceptionCode) {
        let function = self.function() | function::ERROR_MASK;
        let code = u8::from(ex);
        match self {
            Frame::Tcp(x) => x.set_exception(function, code),
            Frame::Rtu(x) => x.set_exception(function, code),
        }
    }

    /// Serialize the frame as it appears on the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Frame::Tcp(x) => x.to_bytes(),
            Frame::Rtu(x) => x.to_bytes(),
        }
    }
}

impl From<TcpFrame> for Frame {
    fn from(frame: TcpFrame) -> Self {
        Frame::Tcp(frame)
    }
}

impl From<RtuFrame> for Frame {
    fn from(frame: RtuFrame) -> Self {
        Frame::Rtu(frame)
    }
}

pub(crate) struct FrameDisplay<'a> {
    level: FrameDecodeLevel,
    frame: &'a Frame,
}

impl<'a> FrameDisplay<'a> {
    pub(crate) fn new(level: FrameDecodeLevel, frame: &'a Frame) -> Self {
        Self { level, frame }
    }
}

impl std::fmt::Display for FrameDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.frame {
            Frame::Tcp(x) => write!(f, "{}", tcp::MbapDisplay::new(self.level, x)),
            Frame::Rtu(x) => write!(f, "{}", rtu::RtuDisplay::new(self.level, x)),
        }
    }
}

pub(crate) struct PduDisplay<'a> {
    level: AppDecodeLevel,
    frame: &'a Frame,
}

impl<'a> PduDisplay<'a> {
    pub(crate) fn new(level: AppDecodeLevel, frame: &'a Frame) -> Self {
        Self { level, frame }
    }
}

impl std::fmt::Display for PduDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let function = self.frame.function();
        if function & function::ERROR_MASK != 0 {
            write!(f, "function: {function:#04X} (exception)")?;
            if let Some(code) = self.frame.data().first() {
                write!(f, " {}", ExceptionCode::from(*code))?;
            }
            return Ok(());
        }
        write!(f, "function: {function:#04X}")?;
        if self.level.data_headers() {
            write!(f, " (payload len = {})", self.frame.data().len())?;
        }
        if self.level.data_values() {
            crate::common::phys::format_bytes(f, self.frame.data())?;
        }
        Ok(())
    }
}
