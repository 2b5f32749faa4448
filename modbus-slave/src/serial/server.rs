use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::error::SessionError;
use crate::frame::{Frame, FrameDisplay, RtuFrame};
use crate::server::task::{Channel, Message, Request};

/// Read loop for one open serial port
///
/// Unlike a TCP session, a malformed frame doesn't end the loop. Only the serial shutdown
/// token (a child of the server context), an I/O error or the end of the dispatcher do.
pub(crate) struct RtuServerTask {
    reader: ReadHalf<PhysLayer>,
    channel: Channel,
    silence: Duration,
    tx: mpsc::Sender<Message>,
    decode: DecodeLevel,
    shutdown: CancellationToken,
}

impl RtuServerTask {
    pub(crate) fn new(
        phys: PhysLayer,
        silence: Duration,
        tx: mpsc::Sender<Message>,
        decode: DecodeLevel,
        shutdown: CancellationToken,
    ) -> Self {
        let (reader, writer) = tokio::io::split(phys);
        Self {
            reader,
            channel: Channel::new(writer),
            silence,
            tx,
            decode,
            shutdown,
        }
    }

    /// handle used to shut the port down once this task has exited
    pub(crate) fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub(crate) async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("serial port shutdown");
            }
            err = self.run_inner() => {
                match err {
                    SessionError::Shutdown => tracing::debug!("serial port shutdown"),
                    err => tracing::error!("serial port closed: {}", err),
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
        let bytes =
            crate::frame::rtu::read_frame(&mut self.reader, self.silence, self.decode.physical)
                .await?;

        let frame = match RtuFrame::parse(&bytes) {
            Ok(frame) => Frame::Rtu(frame),
            Err(err) => {
                tracing::warn!("discarding frame: {}", err);
                return Ok(());
            }
        };

        if self.decode.frame.enabled() {
            tracing::info!("RTU RX - {}", FrameDisplay::new(self.decode.frame, &frame));
        }

        self.tx
            .send(Message::Request(Request::new(self.channel.clone(), frame)))
            .await
            .map_err(|_| SessionError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::common::phys::MIN_INTER_FRAME_DELAY;
    use crate::server::function::FunctionTable;
    use crate::server::memory::Memory;
    use crate::server::task::{Dispatcher, Registry};

    const READ_COILS_REQUEST: &[u8] = &[0x2A, 0x01, 0x00, 0x10, 0x00, 0x13, 0x7A, 0x19];
    const READ_COILS_RESPONSE: &[u8] = &[0x2A, 0x01, 0x03, 0xCD, 0x6B, 0x05, 0x44, 0x99];

    struct Fixture {
        tx: mpsc::Sender<Message>,
        requests: Arc<AtomicUsize>,
        shutdown: CancellationToken,
        port: tokio::io::DuplexStream,
        task: tokio::task::JoinHandle<()>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(Registry::new(FunctionTable::with_builtins()));
            let requests = Arc::new(AtomicUsize::new(0));
            {
                let requests = requests.clone();
                registry.add_observer(Arc::new(move |_: &Memory, _: &Frame| {
                    requests.fetch_add(1, Ordering::SeqCst);
                }));
            }

            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(Dispatcher::new(registry, DecodeLevel::nothing(), rx).run());

            let (local, port) = tokio::io::duplex(1024);
            let shutdown = CancellationToken::new();
            let task = tokio::spawn(
                RtuServerTask::new(
                    PhysLayer::new_mock(local),
                    MIN_INTER_FRAME_DELAY,
                    tx.clone(),
                    DecodeLevel::nothing(),
                    shutdown.clone(),
                )
                .run(),
            );

            Self {
                tx,
                requests,
                shutdown,
                port,
                task,
            }
        }

        async fn load_coils(&self) {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let access = move |memory: &mut Memory| {
                for i in 0..19 {
                    memory.coils_mut()[0x10 + i] =
                        crate::common::bits::get_bit(&[0xCD, 0x6B, 0x05], i);
                }
                let _ = reply_tx.send(());
            };
            self.tx
                .send(Message::Access(Box::new(access)))
                .await
                .ok()
                .unwrap();
            reply_rx.await.unwrap();
        }
    }

    #[tokio::test]
    async fn responds_to_valid_frame() {
        let mut fixture = Fixture::new();
        fixture.load_coils().await;

        fixture.port.write_all(READ_COILS_REQUEST).await.unwrap();
        let mut response = [0u8; 8];
        fixture.port.read_exact(&mut response).await.unwrap();

        assert_eq!(response, READ_COILS_RESPONSE);
        assert_eq!(fixture.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn corrupted_frame_is_never_dispatched() {
        let mut fixture = Fixture::new();
        fixture.load_coils().await;

        let mut corrupted = READ_COILS_REQUEST.to_vec();
        corrupted[7] ^= 0xFF;
        fixture.port.write_all(&corrupted).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fixture.requests.load(Ordering::SeqCst), 0);

        // the port keeps listening after a bad frame
        fixture.port.write_all(READ_COILS_REQUEST).await.unwrap();
        let mut response = [0u8; 8];
        fixture.port.read_exact(&mut response).await.unwrap();

        // the only bytes written are the response to the valid frame
        assert_eq!(response, READ_COILS_RESPONSE);
        assert_eq!(fixture.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_token_stops_the_read_loop() {
        let fixture = Fixture::new();
        fixture.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), fixture.task)
            .await
            .unwrap()
            .unwrap();
    }
}
