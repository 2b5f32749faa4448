use std::net::SocketAddr;

use tokio::io::ReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::error::SessionError;
use crate::frame::Frame;
use crate::server::task::{Channel, Message, Request};

/// How an accepted socket becomes a physical layer
#[derive(Clone)]
pub(crate) enum ConnectionHandler {
    Tcp,
    #[cfg(feature = "tls")]
    Tls(crate::tcp::tls::TlsServerConfig),
}

impl ConnectionHandler {
    async fn handle(&self, socket: TcpStream) -> Result<PhysLayer, String> {
        match self {
            Self::Tcp => Ok(PhysLayer::new_tcp(socket)),
            #[cfg(feature = "tls")]
            Self::Tls(config) => config.handle_connection(socket).await,
        }
    }
}

/// Accept loop for one listener
pub(crate) struct ServerTask {
    listener: TcpListener,
    handler: ConnectionHandler,
    tx: mpsc::Sender<Message>,
    decode: DecodeLevel,
    // observed by accepted connections
    context: CancellationToken,
    // stops only the accept loop
    listeners: CancellationToken,
}

impl ServerTask {
    pub(crate) fn new(
        listener: TcpListener,
        handler: ConnectionHandler,
        tx: mpsc::Sender<Message>,
        decode: DecodeLevel,
        context: CancellationToken,
        listeners: CancellationToken,
    ) -> Self {
        Self {
            listener,
            handler,
            tx,
            decode,
            context,
            listeners,
        }
    }

    pub(crate) async fn run(self) {
        loop {
            tokio::select! {
                _ = self.listeners.cancelled() => {
                    tracing::debug!("stopped listening");
                    return;
                }
                result = self.listener.accept() => {
                    match result {
                        Err(err) => {
                            tracing::error!("error accepting connection: {}", err);
                            return;
                        }
                        Ok((socket, addr)) => self.handle(socket, addr),
                    }
                }
            }
        }
    }

    fn handle(&self, socket: TcpStream, addr: SocketAddr) {
        tracing::debug!("accepted connection from: {}", addr);

        let handler = self.handler.clone();
        let tx = self.tx.clone();
        let decode = self.decode;
        let token = self.context.clone();

        let session = async move {
            // any TLS handshake runs on the session task, never on the accept loop
            let phys = tokio::select! {
                _ = token.cancelled() => return,
                result = handler.handle(socket) => {
                    match result {
                        Ok(phys) => phys,
                        Err(err) => {
                            tracing::error!("{}", err);
                            return;
                        }
                    }
                }
            };

            SessionTask::new(phys, tx, decode, token).run().await;
        };

        tokio::spawn(session.instrument(tracing::info_span!("Session", "remote" = ?addr)));
    }
}

/// Read loop for one accepted connection
pub(crate) struct SessionTask {
    reader: ReadHalf<PhysLayer>,
    channel: Channel,
    tx: mpsc::Sender<Message>,
    decode: DecodeLevel,
    token: CancellationToken,
}

impl SessionTask {
    pub(crate) fn new(
        phys: PhysLayer,
        tx: mpsc::Sender<Message>,
        decode: DecodeLevel,
        token: CancellationToken,
    ) -> Self {
        let (reader, writer) = tokio::io::split(phys);
        Self {
            reader,
            channel: Channel::new(writer),
            tx,
            decode,
            token,
        }
    }

    pub(crate) async fn run(mut self) {
        let token = self.token.clone();
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("session shutdown");
            }
            err = self.run_inner() => {
                match err {
                    SessionError::Disconnected => tracing::debug!("peer disconnected"),
                    SessionError::Shutdown => tracing::debug!("session shutdown"),
                    err => tracing::error!("closing session: {}", err),
                }
            }
        }
    }

    async fn run_inner(&mut self) -> SessionError {
        loop {
            if let Err(err) = self.run_one().await {
                return err;
            }
        }
    }

    async fn run_one(&mut self) -> Result<(), SessionError> {
        let frame = crate::frame::tcp::read_frame(&mut self.reader, self.decode).await?;
        let request = Request::new(self.channel.clone(), Frame::Tcp(frame));
        self.tx
            .send(Message::Request(request))
            .await
            .map_err(|_| SessionError::Shutdown)
    }
}
