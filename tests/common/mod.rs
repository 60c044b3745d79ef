#![allow(dead_code)]

use pacegate::{ManualClock, Sleeper};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub String);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

/// Sleeper that "waits" by moving a manual clock forward.
#[derive(Debug, Clone)]
pub struct AdvancingSleeper {
    clock: ManualClock,
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl AdvancingSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }
}

impl Sleeper for AdvancingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap().push(duration);
        self.clock.advance(duration);
        Box::pin(async {
            tokio::task::yield_now().await;
        })
    }
}

/// Collects formatted log output in memory.
#[derive(Clone, Default)]
pub struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install a debug-level subscriber writing into the returned buffer for this thread.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .without_time()
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (writer, guard)
}
