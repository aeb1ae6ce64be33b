//! Общие утилиты интеграционных тестов: транспорт с подсчётом вызовов,
//! внедрением ошибок и задержкой подписки.

#![allow(dead_code)]

use std::{
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pubsub_bridge::{Disposer, MemoryTransport, MessageHandler, Transport, TransportError};
use tokio::sync::watch;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// Обёртка над [`MemoryTransport`], считающая подписки и освобождения.
pub struct RecordingTransport {
    pub inner: MemoryTransport,
    subscribe_calls: AtomicUsize,
    dispose_calls: Arc<AtomicUsize>,
    fail_subscribe: Mutex<Option<TransportError>>,
    fail_dispose: Arc<AtomicBool>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryTransport::new(64),
            subscribe_calls: AtomicUsize::new(0),
            dispose_calls: Arc::new(AtomicUsize::new(0)),
            fail_subscribe: Mutex::new(None),
            fail_dispose: Arc::new(AtomicBool::new(false)),
            gate: Mutex::new(None),
        })
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    /// Следующие подписки завершаются ошибкой, пока не вызван
    /// `clear_failures`.
    pub fn fail_subscribes(
        &self,
        reason: &str,
    ) {
        *self.fail_subscribe.lock() = Some(TransportError::Unavailable {
            reason: reason.to_string(),
        });
    }

    pub fn fail_disposals(&self) {
        self.fail_dispose.store(true, Ordering::SeqCst);
    }

    pub fn clear_failures(&self) {
        *self.fail_subscribe.lock() = None;
        self.fail_dispose.store(false, Ordering::SeqCst);
    }

    /// Задерживает подписки до отправки `true` в возвращённый `Sender`.
    pub fn hold_subscribes(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock() = Some(rx);
        tx
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn publish(
        &self,
        channel: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.inner.publish(channel, payload)
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Disposer>, TransportError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        let failure = self.fail_subscribe.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }

        let inner = self.inner.subscribe(channel, handler).await?;
        Ok(Box::new(RecordingDisposer {
            channel: channel.to_string(),
            inner,
            calls: Arc::clone(&self.dispose_calls),
            fail: Arc::clone(&self.fail_dispose),
        }))
    }
}

struct RecordingDisposer {
    channel: String,
    inner: Box<dyn Disposer>,
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl Disposer for RecordingDisposer {
    async fn dispose(self: Box<Self>) -> Result<(), TransportError> {
        let this = *self;
        this.calls.fetch_add(1, Ordering::SeqCst);
        this.inner.dispose().await?;
        if this.fail.load(Ordering::SeqCst) {
            return Err(TransportError::DisposeFailed {
                channel: this.channel,
                reason: "broker went away".to_string(),
            });
        }
        Ok(())
    }
}

/// Ждёт, пока `condition` не станет истинным (не дольше секунды).
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// `future` с таймаутом в секунду.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), future)
        .await
        .expect("timed out")
}

/// Даёт фоновым задачам доставить всё, что уже опубликовано.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Буфер, в который пишет тестовый `tracing`-подписчик.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Перенаправляет логи текущего потока в буфер, пока жив guard.
    pub fn install() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(
        &mut self,
        buf: &[u8],
    ) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
