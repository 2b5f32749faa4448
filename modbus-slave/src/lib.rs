//! An implementation of the slave (server) side of [Modbus](http://modbus.org/) using
//! [Tokio](https://docs.rs/tokio) and Rust's `async/await` syntax.
//!
//! # Features
//!
//! * One memory map shared by every transport, owned by a single task
//! * Requests processed one at a time, in the order they were received on each transport
//! * Panic-free parsing
//! * Handlers replaceable per function code at runtime, including custom function codes
//! * Observers notified of every request after it was handled
//!
//! # Supported modes
//!
//! * TCP and TLS listeners (MBAP framing)
//! * RTU over serial (CRC framing, silence-based frame boundaries)
//!
//! # Built-in functions
//!
//! * Read Coils
//! * Read Discrete Inputs
//! * Read Holding Registers
//! * Read Input Registers
//! * Write Single Coil
//! * Write Single Register
//! * Write Multiple Coils
//! * Write Multiple Registers
//!
//! Any other function code answers with the `IllegalFunction` exception until a handler is
//! registered for it.
//!
//! # Example
//!
//! ```no_run
//! use modbus_slave::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new();
//!
//!     // custom function code answering with a fixed byte
//!     server.register_function_handler(0x41, |_memory, _frame| Ok(vec![0xAA]));
//!
//!     server.set_on_request(|_memory, frame| {
//!         tracing::info!("handled function {:#04X}", frame.function());
//!     });
//!
//!     server
//!         .with_memory(|memory| memory.holding_registers_mut()[0] = 42)
//!         .await?;
//!
//!     server.listen_tcp("127.0.0.1:502".parse()?).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     server.close().await;
//!     Ok(())
//! }
//! ```

mod common;
mod constants;
mod decode;
mod error;
mod exception;
mod frame;
mod serial;
mod server;
mod tcp;
mod types;

pub use crate::decode::*;
pub use crate::error::{FrameParseError, ListenError, Shutdown};
pub use crate::exception::ExceptionCode;
pub use crate::frame::{Frame, RtuFrame, TcpFrame};
pub use crate::serial::{DataBits, FlowControl, Parity, SerialSettings, StopBits};
pub use crate::server::{FunctionHandler, Memory, Observer, Server, ServerConfig, TABLE_SIZE};
#[cfg(feature = "tls")]
pub use crate::tcp::tls::{MinTlsVersion, TlsError, TlsServerConfig};
pub use crate::types::AddressRange;
