use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;

use crate::common::phys::{PhysDisplay, PhysLayer};
use crate::decode::DecodeLevel;
use crate::exception::ExceptionCode;
use crate::frame::{Frame, FrameDisplay, PduDisplay};
use crate::server::function::{FunctionHandler, FunctionTable, Observer};
use crate::server::memory::Memory;

/// Write side of a connection or serial port, carried by every request it produced
#[derive(Clone)]
pub(crate) struct Channel {
    writer: Arc<Mutex<WriteHalf<PhysLayer>>>,
}

impl Channel {
    pub(crate) fn new(writer: WriteHalf<PhysLayer>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub(crate) async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    pub(crate) async fn shutdown(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

/// A decoded frame paired with the channel its response goes back on
pub(crate) struct Request {
    channel: Channel,
    frame: Frame,
}

impl Request {
    pub(crate) fn new(channel: Channel, frame: Frame) -> Self {
        Self { channel, frame }
    }
}

pub(crate) type MemoryAccess = Box<dyn FnOnce(&mut Memory) + Send>;

pub(crate) enum Message {
    Request(Request),
    Access(MemoryAccess),
}

/// Handlers and observers, shared between the dispatcher and the server handle
pub(crate) struct Registry {
    functions: RwLock<FunctionTable>,
    observers: RwLock<Vec<Observer>>,
}

impl Registry {
    pub(crate) fn new(functions: FunctionTable) -> Self {
        Self {
            functions: RwLock::new(functions),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn set_handler(&self, code: u8, handler: FunctionHandler) {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(code, handler);
    }

    pub(crate) fn add_observer(&self, observer: Observer) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn handler(&self, code: u8) -> Option<FunctionHandler> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code)
    }

    // snapshot so an observer may register another observer without deadlocking
    fn observers(&self) -> Vec<Observer> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The only task that touches the memory
///
/// Requests from every transport are processed one at a time, in the order they were queued.
pub(crate) struct Dispatcher {
    memory: Memory,
    registry: Arc<Registry>,
    decode: DecodeLevel,
    rx: mpsc::Receiver<Message>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<Registry>,
        decode: DecodeLevel,
        rx: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            memory: Memory::new(),
            registry,
            decode,
            rx,
        }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run().instrument(tracing::info_span!("Modbus-Server-Dispatcher")));
    }

    pub(crate) async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Request(request) => self.process(request).await,
                Message::Access(access) => access(&mut self.memory),
            }
        }
        tracing::debug!("all request sources closed");
    }

    async fn process(&mut self, request: Request) {
        let Request { channel, frame } = request;

        if self.decode.app.enabled() {
            tracing::info!("PDU RX - {}", PduDisplay::new(self.decode.app, &frame));
        }

        let response = self.respond(&frame);

        for observer in self.registry.observers() {
            observer(&self.memory, &frame);
        }

        if self.decode.app.enabled() {
            tracing::info!("PDU TX - {}", PduDisplay::new(self.decode.app, &response));
        }
        if self.decode.frame.enabled() {
            tracing::info!("FRAME TX - {}", FrameDisplay::new(self.decode.frame, &response));
        }

        let bytes = response.to_bytes();
        if self.decode.physical.enabled() {
            tracing::info!("PHYS TX - {}", PhysDisplay::new(self.decode.physical, &bytes));
        }

        if let Err(err) = channel.write(&bytes).await {
            tracing::error!("unable to write response: {}", err);
        }
    }

    fn respond(&mut self, request: &Frame) -> Frame {
        let mut response = request.clone();

        let handler = match self.registry.handler(request.function()) {
            Some(handler) => handler,
            None => {
                tracing::debug!(
                    "no handler for function code: {:#04X}",
                    request.function()
                );
                response.set_exception(ExceptionCode::IllegalFunction);
                return response;
            }
        };

        match handler(&mut self.memory, request) {
            Ok(data) => {
                let length = data.len();
                if let Err(err) = response.set_data(data) {
                    tracing::error!(
                        "handler for function code {:#04X} produced {} bytes: {}",
                        request.function(),
                        length,
                        err
                    );
                    response.set_exception(ExceptionCode::ServerDeviceFailure);
                }
            }
            Err(ex) => response.set_exception(ex),
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::frame::{RtuFrame, TcpFrame};

    struct Fixture {
        tx: mpsc::Sender<Message>,
        registry: Arc<Registry>,
        channel: Channel,
        peer: tokio::io::DuplexStream,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_buffer(1024)
        }

        fn with_buffer(size: usize) -> Self {
            let registry = Arc::new(Registry::new(FunctionTable::with_builtins()));
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(Dispatcher::new(registry.clone(), DecodeLevel::nothing(), rx).run());

            let (local, peer) = tokio::io::duplex(size);
            let (_, writer) = tokio::io::split(PhysLayer::new_mock(local));

            Self {
                tx,
                registry,
                channel: Channel::new(writer),
                peer,
            }
        }

        async fn send(&self, frame: Frame) {
            self.tx
                .send(Message::Request(Request::new(self.channel.clone(), frame)))
                .await
                .ok()
                .unwrap();
        }

        async fn receive(&mut self, count: usize) -> Vec<u8> {
            let mut bytes = vec![0u8; count];
            self.peer.read_exact(&mut bytes).await.unwrap();
            bytes
        }
    }

    #[tokio::test]
    async fn unregistered_function_is_illegal_function() {
        let mut fixture = Fixture::new();
        fixture
            .send(Frame::Tcp(TcpFrame::new(0x0102, 0x01, 0x63, vec![]).unwrap()))
            .await;
        assert_eq!(
            fixture.receive(9).await,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0xE3, 0x01]
        );
    }

    #[tokio::test]
    async fn custom_handler_result_becomes_payload() {
        let mut fixture = Fixture::new();
        fixture
            .registry
            .set_handler(0x41, Arc::new(|_: &mut Memory, _: &Frame| -> Result<Vec<u8>, ExceptionCode> {
                Ok(vec![0xAA])
            }));
        fixture
            .send(Frame::Tcp(TcpFrame::new(0x0001, 0x01, 0x41, vec![]).unwrap()))
            .await;
        assert_eq!(
            fixture.receive(9).await,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x41, 0xAA]
        );
    }

    #[tokio::test]
    async fn oversized_handler_payload_is_device_failure() {
        let mut fixture = Fixture::new();
        fixture
            .registry
            .set_handler(0x42, Arc::new(|_: &mut Memory, _: &Frame| -> Result<Vec<u8>, ExceptionCode> {
                Ok(vec![0; 253])
            }));
        fixture
            .send(Frame::Rtu(RtuFrame::new(0x01, 0x42, vec![]).unwrap()))
            .await;
        let expected = RtuFrame::new(0x01, 0xC2, vec![0x04]).unwrap().to_bytes();
        assert_eq!(fixture.receive(expected.len()).await, expected);
    }

    #[tokio::test]
    async fn observers_run_in_registration_order_with_the_request() {
        let mut fixture = Fixture::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        for id in 0..3 {
            let calls = calls.clone();
            fixture
                .registry
                .add_observer(Arc::new(move |memory: &Memory, frame: &Frame| {
                    calls
                        .lock()
                        .unwrap()
                        .push((id, frame.function(), memory.coils()[0x10]));
                }));
        }

        let request = RtuFrame::new(0x2A, 0x05, vec![0x00, 0x10, 0xFF, 0x00]).unwrap();
        fixture.send(Frame::Rtu(request.clone())).await;
        // write single coil echoes the request
        assert_eq!(fixture.receive(8).await, request.to_bytes());

        // observers see the memory after the handler ran
        assert_eq!(
            *calls.lock().unwrap(),
            vec![(0, 0x05, true), (1, 0x05, true), (2, 0x05, true)]
        );
    }

    #[tokio::test]
    async fn observer_may_register_another_observer() {
        let mut fixture = Fixture::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let registry = fixture.registry.clone();
            let count = count.clone();
            fixture
                .registry
                .add_observer(Arc::new(move |_: &Memory, _: &Frame| {
                    let count = count.clone();
                    registry.add_observer(Arc::new(move |_: &Memory, _: &Frame| {
                        count.fetch_add(1, Ordering::SeqCst);
                    }));
                }));
        }

        let request = Frame::Rtu(RtuFrame::new(0x01, 0x06, vec![0x00, 0x00, 0x00, 0x01]).unwrap());
        fixture.send(request.clone()).await;
        fixture.receive(8).await;
        fixture.send(request).await;
        fixture.receive(8).await;

        // the observer added during the first request ran on the second
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_access_is_serialized_with_requests() {
        let mut fixture = Fixture::new();
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        fixture
            .tx
            .send(Message::Access(Box::new(|memory: &mut Memory| {
                memory.holding_registers_mut()[7] = 0xBEEF;
            })))
            .await
            .ok()
            .unwrap();
        fixture
            .send(Frame::Tcp(
                TcpFrame::new(0x0000, 0x01, 0x03, vec![0x00, 0x07, 0x00, 0x01]).unwrap(),
            ))
            .await;
        assert_eq!(
            fixture.receive(11).await,
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0xBE, 0xEF]
        );

        fixture
            .tx
            .send(Message::Access(Box::new(move |memory: &mut Memory| {
                let _ = reply_tx.send(memory.holding_registers()[7]);
            })))
            .await
            .ok()
            .unwrap();
        assert_eq!(reply_rx.await.unwrap(), 0xBEEF);
    }

    #[tokio::test]
    async fn unread_response_holds_up_the_next_message() {
        let mut fixture = Fixture::with_buffer(4);

        // 9 byte response, more than the peer buffers without reading
        fixture
            .send(Frame::Rtu(
                RtuFrame::new(0x01, 0x03, vec![0x00, 0x00, 0x00, 0x02]).unwrap(),
            ))
            .await;

        let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
        fixture
            .tx
            .send(Message::Access(Box::new(move |_: &mut Memory| {
                let _ = reply_tx.send(());
            })))
            .await
            .ok()
            .unwrap();

        let pending =
            tokio::time::timeout(tokio::time::Duration::from_millis(50), &mut reply_rx).await;
        assert!(pending.is_err());

        fixture.receive(9).await;
        reply_rx.await.unwrap();
    }
}
