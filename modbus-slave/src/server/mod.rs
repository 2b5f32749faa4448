use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::error::{ListenError, Shutdown};
use crate::exception::ExceptionCode;
use crate::frame::Frame;
use crate::serial::server::RtuServerTask;
use crate::server::function::FunctionTable;
use crate::server::task::{Channel, Dispatcher, Message, Registry};
use crate::tcp::server::{ConnectionHandler, ServerTask};

pub(crate) mod builtin;
pub(crate) mod function;
pub(crate) mod memory;
pub(crate) mod task;

pub use function::{FunctionHandler, Observer};
pub use memory::{Memory, TABLE_SIZE};

/// Server configuration
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerConfig {
    /// Protocol decoding applied to every transport of the server
    pub decode: DecodeLevel,
}

impl ServerConfig {
    /// Construct a configuration with the given decode level
    pub fn new(decode: DecodeLevel) -> Self {
        Self { decode }
    }
}

/// A Modbus server (slave) serving one memory over any number of transports
///
/// Construction spawns the task that owns the memory, so it must happen inside a Tokio
/// runtime. Every transport attached with a `listen_*` method feeds that same task.
/// Requests are processed one at a time in the order they reach it. Within a connection or
/// port that is the order they were received, across transports it is not deterministic.
///
/// The response is written by that same task before it takes the next request. A master
/// that stops reading its responses eventually fills the socket buffer and stalls every
/// transport, as does an observer that blocks.
///
/// Dropping the server cancels every task it started.
pub struct Server {
    tx: mpsc::Sender<Message>,
    registry: Arc<Registry>,
    decode: DecodeLevel,
    // process-wide, observed by every task
    context: CancellationToken,
    // cancelled by close() to stop the accept loops
    listeners: CancellationToken,
    // cancelled by close() to stop the serial read loops
    serial: CancellationToken,
    listener_tasks: TaskTracker,
    serial_tasks: TaskTracker,
    ports: Mutex<Vec<Channel>>,
}

impl Server {
    /// Create a server with the default configuration
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a server with the provided configuration
    pub fn with_config(config: ServerConfig) -> Self {
        Self::with_context(&CancellationToken::new(), config)
    }

    /// Create a server whose tasks also stop when `parent` is cancelled
    pub fn with_context(parent: &CancellationToken, config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new(FunctionTable::with_builtins()));
        let (tx, rx) = mpsc::channel(1);
        Dispatcher::new(registry.clone(), config.decode, rx).spawn();

        let context = parent.child_token();
        let listeners = context.child_token();
        let serial = context.child_token();

        Self {
            tx,
            registry,
            decode: config.decode,
            context,
            listeners,
            serial,
            listener_tasks: TaskTracker::new(),
            serial_tasks: TaskTracker::new(),
            ports: Mutex::new(Vec::new()),
        }
    }

    /// Install the handler for a function code, replacing the built-in or custom handler
    /// already installed for it
    ///
    /// Takes effect for the next request processed, no restart required.
    pub fn register_function_handler<F>(&self, code: u8, handler: F)
    where
        F: Fn(&mut Memory, &Frame) -> Result<Vec<u8>, ExceptionCode> + Send + Sync + 'static,
    {
        self.registry.set_handler(code, Arc::new(handler));
    }

    /// Append an observer invoked with every request after it was handled
    ///
    /// Observers run in registration order on the task that owns the memory, before the
    /// response is written. An observer that blocks stalls every transport.
    pub fn set_on_request<F>(&self, observer: F)
    where
        F: Fn(&Memory, &Frame) + Send + Sync + 'static,
    {
        self.registry.add_observer(Arc::new(observer));
    }

    /// Run a closure against the memory, in turn with the requests of every transport
    ///
    /// Use it to preload or inspect values without racing the masters.
    pub async fn with_memory<F, R>(&self, f: F) -> Result<R, Shutdown>
    where
        F: FnOnce(&mut Memory) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let access = move |memory: &mut Memory| {
            let _ = reply_tx.send(f(memory));
        };
        self.tx
            .send(Message::Access(Box::new(access)))
            .await
            .map_err(|_| Shutdown)?;
        reply_rx.await.map_err(|_| Shutdown)
    }

    /// Bind a TCP listener and accept masters on it
    ///
    /// Returns the bound address once the accept loop is running.
    pub async fn listen_tcp(&self, addr: SocketAddr) -> Result<SocketAddr, ListenError> {
        self.check_open()?;
        let listener = TcpListener::bind(addr).await.map_err(|err| {
            tracing::error!("unable to bind {}: {}", addr, err);
            err
        })?;
        self.listen_with_listener(listener)
    }

    /// Accept masters on a listener bound by the caller
    pub fn listen_with_listener(&self, listener: TcpListener) -> Result<SocketAddr, ListenError> {
        self.check_open()?;
        let addr = listener.local_addr()?;
        let task = self.server_task(listener, ConnectionHandler::Tcp);
        self.listener_tasks
            .spawn(task.run().instrument(tracing::info_span!("Modbus-Server-TCP", "listen" = ?addr)));
        tracing::debug!("listening on {}", addr);
        Ok(addr)
    }

    /// Bind a TCP listener and accept masters on it over TLS
    #[cfg(feature = "tls")]
    pub async fn listen_tls(
        &self,
        addr: SocketAddr,
        config: crate::tcp::tls::TlsServerConfig,
    ) -> Result<SocketAddr, ListenError> {
        self.check_open()?;
        let listener = TcpListener::bind(addr).await.map_err(|err| {
            tracing::error!("unable to bind {}: {}", addr, err);
            err
        })?;
        self.listen_tls_with_listener(listener, config)
    }

    /// Accept masters over TLS on a listener bound by the caller
    #[cfg(feature = "tls")]
    pub fn listen_tls_with_listener(
        &self,
        listener: TcpListener,
        config: crate::tcp::tls::TlsServerConfig,
    ) -> Result<SocketAddr, ListenError> {
        self.check_open()?;
        let addr = listener.local_addr()?;
        let task = self.server_task(listener, ConnectionHandler::Tls(config));
        self.listener_tasks
            .spawn(task.run().instrument(tracing::info_span!("Modbus-Server-TLS", "listen" = ?addr)));
        tracing::debug!("listening for TLS on {}", addr);
        Ok(addr)
    }

    /// Open a serial port and serve RTU requests received on it
    #[cfg(feature = "serial")]
    pub fn listen_rtu(
        &self,
        path: &str,
        settings: crate::serial::SerialSettings,
    ) -> Result<(), ListenError> {
        if self.serial.is_cancelled() {
            return Err(ListenError::Closed);
        }
        let port = crate::serial::open(path, settings).map_err(|err| {
            tracing::error!("unable to open {}: {}", path, err);
            err
        })?;
        tracing::debug!("opened serial port {}", path);
        self.attach_rtu(
            PhysLayer::new_serial(port),
            settings.inter_frame_delay(),
            tracing::info_span!("Modbus-Server-RTU", "port" = path),
        );
        Ok(())
    }

    #[cfg_attr(not(any(feature = "serial", test)), allow(dead_code))]
    pub(crate) fn attach_rtu(
        &self,
        phys: PhysLayer,
        silence: tokio::time::Duration,
        span: tracing::Span,
    ) {
        let task = RtuServerTask::new(
            phys,
            silence,
            self.tx.clone(),
            self.decode,
            self.serial.clone(),
        );
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.channel());
        self.serial_tasks.spawn(task.run().instrument(span));
    }

    /// Stop the transports
    ///
    /// Stops accepting connections and waits for every accept loop to release its listener,
    /// then stops every serial read loop, waits for them to exit and closes the ports.
    /// Connections that were already accepted are not joined; they end when the server is
    /// dropped or the peer disconnects. Calling it again does nothing.
    pub async fn close(&self) {
        self.listeners.cancel();
        self.listener_tasks.close();
        self.listener_tasks.wait().await;

        self.serial.cancel();
        self.serial_tasks.close();
        self.serial_tasks.wait().await;

        let ports = std::mem::take(&mut *self.ports.lock().unwrap_or_else(PoisonError::into_inner));
        for port in ports {
            if let Err(err) = port.shutdown().await {
                tracing::error!("error closing serial port: {}", err);
            }
        }

        tracing::debug!("server closed");
    }

    fn check_open(&self) -> Result<(), ListenError> {
        if self.listeners.is_cancelled() {
            return Err(ListenError::Closed);
        }
        Ok(())
    }

    fn server_task(&self, listener: TcpListener, handler: ConnectionHandler) -> ServerTask {
        ServerTask::new(
            listener,
            handler,
            self.tx.clone(),
            self.decode,
            self.context.clone(),
            self.listeners.clone(),
        )
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.context.cancel();
    }
}
