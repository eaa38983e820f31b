//! In-memory stream driven by a script of reads, for interface and thread
//! tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use linkprims_stream::{Stream, StreamError};

use crate::interface::lock;

enum Step {
    Data(Vec<u8>),
    Closed,
}

#[derive(Default)]
pub(crate) struct Script {
    steps: Mutex<VecDeque<Step>>,
    connect_failures: AtomicUsize,
    connect_attempts: AtomicUsize,
    reads_served: AtomicUsize,
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    connected: AtomicBool,
}

impl Script {
    pub(crate) fn push_read(&self, data: &[u8]) {
        lock(&self.steps).push_back(Step::Data(data.to_vec()));
    }

    pub(crate) fn push_closed(&self) {
        lock(&self.steps).push_back(Step::Closed);
    }

    /// Make the next `count` connects fail.
    pub(crate) fn fail_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn reads_served(&self) -> usize {
        self.reads_served.load(Ordering::SeqCst)
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.written).clone()
    }
}

/// Reads pop the script; an empty script blocks until disconnect.
pub(crate) struct ScriptedStream {
    script: Arc<Script>,
}

impl ScriptedStream {
    pub(crate) fn new() -> (Box<dyn Stream>, Arc<Script>) {
        let script = Arc::new(Script::default());
        let stream = Self {
            script: Arc::clone(&script),
        };
        (Box::new(stream), script)
    }
}

impl Stream for ScriptedStream {
    fn name(&self) -> &'static str {
        "SCRIPTED"
    }

    fn connect(&self) -> linkprims_stream::Result<()> {
        self.script.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failures = &self.script.connect_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StreamError::Connect {
                addr: "scripted".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        self.script.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.script.connected.load(Ordering::SeqCst)
    }

    fn read(&self) -> linkprims_stream::Result<BytesMut> {
        loop {
            if !self.connected() {
                return Err(StreamError::Closed);
            }
            let step = lock(&self.script.steps).pop_front();
            match step {
                Some(Step::Data(data)) => {
                    self.script.reads_served.fetch_add(1, Ordering::SeqCst);
                    return Ok(BytesMut::from(&data[..]));
                }
                Some(Step::Closed) => {
                    self.script.connected.store(false, Ordering::SeqCst);
                    return Err(StreamError::Closed);
                }
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    fn write(&self, data: &[u8]) -> linkprims_stream::Result<()> {
        if self.script.fail_writes.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        lock(&self.script.written).push(data.to_vec());
        Ok(())
    }

    fn disconnect(&self) {
        self.script.connected.store(false, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub(crate) fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
