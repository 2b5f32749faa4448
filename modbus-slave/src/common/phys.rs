use std::fmt::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Duration;

use crate::decode::PhysDecodeLevel;

/// Gap that delimits two RTU frames when the baud rate is high enough that 3.5 character
/// times would be impractically short (remark on page 13 of the serial line guide)
pub(crate) const MIN_INTER_FRAME_DELAY: Duration = Duration::from_micros(1750);

pub(crate) struct PhysLayer {
    layer: PhysLayerImpl,
}

// encapsulates all possible physical layers as an enum
enum PhysLayerImpl {
    Tcp(tokio::net::TcpStream),
    // TLS type is boxed because its size is huge
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<tokio::net::TcpStream>>),
    #[cfg(feature = "serial")]
    Serial(tokio_serial::SerialStream),
    #[cfg(test)]
    Mock(tokio::io::DuplexStream),
}

impl std::fmt::Debug for PhysLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.layer {
            PhysLayerImpl::Tcp(_) => f.write_str("Tcp"),
            #[cfg(feature = "tls")]
            PhysLayerImpl::Tls(_) => f.write_str("Tls"),
            #[cfg(feature = "serial")]
            PhysLayerImpl::Serial(_) => f.write_str("Serial"),
            #[cfg(test)]
            PhysLayerImpl::Mock(_) => f.write_str("Mock"),
        }
    }
}

impl PhysLayer {
    pub(crate) fn new_tcp(socket: tokio::net::TcpStream) -> Self {
        Self {
            layer: PhysLayerImpl::Tcp(socket),
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn new_tls(stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>) -> Self {
        Self {
            layer: PhysLayerImpl::Tls(Box::new(stream)),
        }
    }

    #[cfg(feature = "serial")]
    pub(crate) fn new_serial(stream: tokio_serial::SerialStream) -> Self {
        Self {
            layer: PhysLayerImpl::Serial(stream),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_mock(mock: tokio::io::DuplexStream) -> Self {
        Self {
            layer: PhysLayerImpl::Mock(mock),
        }
    }
}

impl AsyncRead for PhysLayer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().layer {
            PhysLayerImpl::Tcp(x) => Pin::new(x).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            PhysLayerImpl::Tls(x) => Pin::new(x.as_mut()).poll_read(cx, buf),
            #[cfg(feature = "serial")]
            PhysLayerImpl::Serial(x) => Pin::new(x).poll_read(cx, buf),
            #[cfg(test)]
            PhysLayerImpl::Mock(x) => Pin::new(x).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PhysLayer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().layer {
            PhysLayerImpl::Tcp(x) => Pin::new(x).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            PhysLayerImpl::Tls(x) => Pin::new(x.as_mut()).poll_write(cx, buf),
            #[cfg(feature = "serial")]
            PhysLayerImpl::Serial(x) => Pin::new(x).poll_write(cx, buf),
            #[cfg(test)]
            PhysLayerImpl::Mock(x) => Pin::new(x).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().layer {
            PhysLayerImpl::Tcp(x) => Pin::new(x).poll_flush(cx),
            #[cfg(feature = "tls")]
            PhysLayerImpl::Tls(x) => Pin::new(x.as_mut()).poll_flush(cx),
            #[cfg(feature = "serial")]
            PhysLayerImpl::Serial(x) => Pin::new(x).poll_flush(cx),
            #[cfg(test)]
            PhysLayerImpl::Mock(x) => Pin::new(x).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().layer {
            PhysLayerImpl::Tcp(x) => Pin::new(x).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            PhysLayerImpl::Tls(x) => Pin::new(x.as_mut()).poll_shutdown(cx),
            #[cfg(feature = "serial")]
            PhysLayerImpl::Serial(x) => Pin::new(x).poll_shutdown(cx),
            #[cfg(test)]
            PhysLayerImpl::Mock(x) => Pin::new(x).poll_shutdown(cx),
        }
    }
}

pub(crate) struct PhysDisplay<'a> {
    level: PhysDecodeLevel,
    data: &'a [u8],
}

impl<'a> PhysDisplay<'a> {
    pub(crate) fn new(level: PhysDecodeLevel, data: &'a [u8]) -> Self {
        PhysDisplay { level, data }
    }
}

impl<'a> std::fmt::Display for PhysDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} bytes", self.data.len())?;
        if self.level.data_enabled() {
            format_bytes(f, self.data)?;
        }
        Ok(())
    }
}

/// Silence on the line that terminates an RTU frame for a given baud rate
pub(crate) fn inter_frame_delay(baud_rate: u32) -> Duration {
    // Modbus RTU uses 11-bit characters (1 start, 8 data, 1 parity or stop, 1 stop)
    const NUM_BITS_IN_CHAR: u64 = 11;

    // If the baud rate is higher than a certain threshold, then we fix the delay
    const MAX_BAUD_RATE: u32 = 19200;

    if baud_rate == 0 || baud_rate > MAX_BAUD_RATE {
        return MIN_INTER_FRAME_DELAY;
    }

    let character_time = Duration::from_secs(NUM_BITS_IN_CHAR) / baud_rate;
    35 * character_time / 10 // multiply by 3.5
}

const BYTES_PER_DECODE_LINE: usize = 18;

pub(crate) fn format_bytes(f: &mut std::fmt::Formatter, bytes: &[u8]) -> std::fmt::Result {
    for chunk in bytes.chunks(BYTES_PER_DECODE_LINE) {
        writeln!(f)?;
        let mut first = true;
        for byte in chunk {
            if !first {
                f.write_char(' ')?;
            }
            first = false;
            write!(f, "{byte:02X?}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inter_frame_delay_is_three_and_a_half_characters_at_low_baud() {
        // 11 bits at 9600 baud = 1145.83 us per character
        let delay = inter_frame_delay(9600);
        assert!(delay > Duration::from_micros(4000));
        assert!(delay < Duration::from_micros(4020));
    }

    #[test]
    fn inter_frame_delay_is_fixed_at_high_baud() {
        assert_eq!(inter_frame_delay(115200), MIN_INTER_FRAME_DELAY);
        assert_eq!(inter_frame_delay(0), MIN_INTER_FRAME_DELAY);
    }
}
