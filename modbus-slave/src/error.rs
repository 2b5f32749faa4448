/// Errors that occur while decoding a frame received on a transport (TCP, TLS or serial)
///
/// These never reach the remote peer. A stream connection that produces one is closed,
/// a serial port logs it and keeps listening.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameParseError {
    /// Frame is shorter than the minimum size of its encapsulation
    FrameTooShort(usize, usize), // actual size and the minimum size
    /// Received a frame that exceeds the maximum allowed size
    FrameLengthTooBig(usize, usize), // actual size and the maximum size
    /// Received TCP frame with a non-Modbus protocol id
    UnknownProtocolId(u16),
    /// Received TCP frame whose length field is too small to hold a unit id and function code
    MbapLengthTooSmall(usize),
    /// Received TCP frame with a length field that exceeds the max allowed size
    MbapLengthTooBig(usize, usize), // actual size and the maximum size
    /// Received TCP frame whose length field doesn't match the bytes that follow it
    MbapLengthMismatch(usize, usize), // declared length and actual length
    /// Received serial frame whose CRC doesn't match the computed value
    CrcValidationFailure(u16, u16), // received CRC and the expected CRC
}

impl std::error::Error for FrameParseError {}

impl std::fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameParseError::FrameTooShort(size, min) => write!(
                f,
                "received frame of {size} bytes which is less than the minimum of {min} bytes"
            ),
            FrameParseError::FrameLengthTooBig(size, max) => write!(
                f,
                "received frame with length ({size}) that exceeds max allowed size ({max})"
            ),
            FrameParseError::UnknownProtocolId(id) => {
                write!(f, "received TCP frame with non-Modbus protocol id: {id}")
            }
            FrameParseError::MbapLengthTooSmall(size) => write!(
                f,
                "received TCP frame with length field ({size}) too small for unit id and function"
            ),
            FrameParseError::MbapLengthTooBig(size, max) => write!(
                f,
                "received TCP frame with length ({size}) that exceeds max allowed size ({max})"
            ),
            FrameParseError::MbapLengthMismatch(declared, actual) => write!(
                f,
                "length in TCP frame ({declared}) does not match the actual length ({actual})"
            ),
            FrameParseError::CrcValidationFailure(received, expected) => write!(
                f,
                "received incorrect CRC value {received:#06X}, expected {expected:#06X}"
            ),
        }
    }
}

/// Errors returned synchronously by the `listen_*` methods of the server
#[derive(Debug)]
pub enum ListenError {
    /// Unable to bind the socket
    Io(std::io::Error),
    /// The server was already closed
    Closed,
    /// Unable to open the serial port
    #[cfg(feature = "serial")]
    Serial(tokio_serial::Error),
}

impl std::fmt::Display for ListenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenError::Io(err) => write!(f, "unable to listen: {err}"),
            ListenError::Closed => f.write_str("the server has been closed"),
            #[cfg(feature = "serial")]
            ListenError::Serial(err) => write!(f, "unable to open serial port: {err}"),
        }
    }
}

impl std::error::Error for ListenError {}

impl From<std::io::Error> for ListenError {
    fn from(err: std::io::Error) -> Self {
        ListenError::Io(err)
    }
}

#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for ListenError {
    fn from(err: tokio_serial::Error) -> Self {
        ListenError::Serial(err)
    }
}

/// The task processing requests has shut down
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Shutdown;

impl std::fmt::Display for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("the task processing requests has shut down")
    }
}

impl std::error::Error for Shutdown {}

/// Errors that end a single connection or port read loop
#[derive(Debug)]
pub(crate) enum SessionError {
    /// the peer closed the connection
    Disconnected,
    /// underlying I/O failure
    Io(std::io::Error),
    /// the frame could not be decoded
    BadFrame(FrameParseError),
    /// the dispatcher is gone
    Shutdown,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Disconnected => f.write_str("disconnected"),
            SessionError::Io(err) => write!(f, "i/o error: {err}"),
            SessionError::BadFrame(err) => write!(f, "bad frame: {err}"),
            SessionError::Shutdown => f.write_str("shutdown"),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => SessionError::Disconnected,
            _ => SessionError::Io(err),
        }
    }
}

impl From<FrameParseError> for SessionError {
    fn from(err: FrameParseError) -> Self {
        SessionError::BadFrame(err)
    }
}

impl From<Shutdown> for SessionError {
    fn from(_: Shutdown) -> Self {
        SessionError::Shutdown
    }
}
