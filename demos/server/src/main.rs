//! Example Modbus slave serving one memory map over TCP, TLS and RTU

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use modbus_slave::*;

#[derive(Parser)]
#[command(name = "slave-server")]
#[command(about = "A Modbus slave serving a single memory map on every configured transport")]
#[command(version = "0.1.0")]
struct Cli {
    #[arg(long, help = "TCP socket address to listen on, may be repeated")]
    tcp: Vec<SocketAddr>,

    #[arg(long, help = "TLS socket address to listen on", requires_all = ["cert", "key"])]
    tls: Option<SocketAddr>,

    #[arg(long, help = "PEM file holding the server certificate chain")]
    cert: Option<PathBuf>,

    #[arg(long, help = "PEM file holding the server private key")]
    key: Option<PathBuf>,

    #[arg(long, help = "PEM file of the authorities masters must chain to")]
    ca: Option<PathBuf>,

    #[arg(long, help = "Serial port serving RTU requests, e.g. /dev/ttyUSB0")]
    serial: Option<String>,

    #[arg(long, default_value = "9600", help = "Baud rate of the serial port")]
    baud: u32,

    #[arg(long, value_enum, default_value = "headers", help = "Protocol decoding to log")]
    decode: Decode,
}

#[derive(Copy, Clone, ValueEnum)]
enum Decode {
    Nothing,
    Headers,
    Values,
    Frames,
    Physical,
}

impl From<Decode> for DecodeLevel {
    fn from(value: Decode) -> Self {
        match value {
            Decode::Nothing => DecodeLevel::nothing(),
            Decode::Headers => AppDecodeLevel::DataHeaders.into(),
            Decode::Values => AppDecodeLevel::DataValues.into(),
            Decode::Frames => DecodeLevel::new(
                AppDecodeLevel::DataValues,
                FrameDecodeLevel::Payload,
                PhysDecodeLevel::Nothing,
            ),
            Decode::Physical => DecodeLevel::new(
                AppDecodeLevel::DataValues,
                FrameDecodeLevel::Payload,
                PhysDecodeLevel::Data,
            ),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // print log messages to the console
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let server = Server::with_config(ServerConfig::new(cli.decode.into()));

    // vendor function answering with the number of non-zero holding registers
    server.register_function_handler(0x41, |memory, frame| {
        if !frame.data().is_empty() {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let count = memory
            .holding_registers()
            .iter()
            .filter(|value| **value != 0)
            .count() as u32;
        Ok(count.to_be_bytes().to_vec())
    });

    server.set_on_request(|_memory, frame| {
        tracing::info!(
            "unit: {} function: {:#04X}",
            frame.unit_id(),
            frame.function()
        );
    });

    server
        .with_memory(|memory| {
            for (index, value) in memory.input_registers_mut().iter_mut().take(10).enumerate() {
                *value = index as u16;
            }
        })
        .await?;

    let addresses = if cli.tcp.is_empty() && cli.tls.is_none() && cli.serial.is_none() {
        vec!["127.0.0.1:502".parse()?]
    } else {
        cli.tcp
    };

    for addr in addresses {
        let local = server.listen_tcp(addr).await?;
        tracing::info!("listening for TCP on {}", local);
    }

    if let (Some(addr), Some(cert), Some(key)) = (cli.tls, cli.cert, cli.key) {
        let config = TlsServerConfig::new(&cert, &key, cli.ca.as_deref(), MinTlsVersion::V1_2)?;
        let local = server.listen_tls(addr, config).await?;
        tracing::info!("listening for TLS on {}", local);
    }

    if let Some(path) = cli.serial {
        let settings = SerialSettings {
            baud_rate: cli.baud,
            ..Default::default()
        };
        server.listen_rtu(&path, settings)?;
        tracing::info!("serving RTU on {}", path);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.close().await;

    Ok(())
}
