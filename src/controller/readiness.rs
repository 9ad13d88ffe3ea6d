use crate::util::{
    async_flag,
    runnable::{Exited, Runnable},
};
use async_trait::async_trait;
use futures::{FutureExt, select};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 10;

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReadinessEvent {
    pub ready: bool,
}

// Polls a readiness conjunction and emits exactly one event per 0->1
// transition; the latch resets when readiness regresses. Subscriber channels
// are buffered and non-blocking: a slow subscriber drops events silently and
// can recover via polling.
pub struct ReadinessWatcher {
    poll_interval: Duration,
    probe: Box<dyn Fn() -> bool + Send + Sync>,

    ready: AtomicBool,
    emitted: AtomicBool,
    subscribers: Mutex<Vec<tokio::sync::mpsc::Sender<ReadinessEvent>>>,
}
impl ReadinessWatcher {
    pub fn new(
        poll_interval: Duration,
        probe: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            poll_interval,
            probe: Box::new(probe),

            ready: AtomicBool::new(false),
            emitted: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::Receiver<ReadinessEvent> {
        let (sender, receiver) = tokio::sync::mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().push(sender);
        receiver
    }

    fn broadcast(
        &self,
        event: ReadinessEvent,
    ) {
        self.subscribers.lock().retain(|subscriber| {
            match subscriber.try_send(event) {
                Ok(()) => true,
                // full buffer: drop the event, keep the subscriber
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => true,
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn tick(&self) {
        let ready = (self.probe)();
        self.ready.store(ready, Ordering::Relaxed);

        if ready {
            if !self.emitted.swap(true, Ordering::AcqRel) {
                log::info!("{}: became ready", self);
                self.broadcast(ReadinessEvent { ready: true });
            }
        } else {
            self.emitted.store(false, Ordering::Release);
        }
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        loop {
            self.tick();

            select! {
                () = tokio::time::sleep(self.poll_interval).fuse() => {},
                () = exit_flag => break,
            }
        }

        Exited
    }
}
#[async_trait]
impl Runnable for ReadinessWatcher {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for ReadinessWatcher {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "ReadinessWatcher")
    }
}
