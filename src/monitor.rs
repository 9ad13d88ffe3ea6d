use crate::{
    config::MonitorConfig,
    datatypes::device_path::DevicePath,
    util::{
        async_flag,
        runnable::{Exited, Runnable},
    },
};
use anyhow::{Context, Error};
use async_trait::async_trait;
use futures::{FutureExt, channel::mpsc, select};
use parking_lot::Mutex;
use regex::Regex;
use std::{
    collections::HashSet,
    fmt,
    path::PathBuf,
    sync::{
        LazyLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::fs;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CameraEvent {
    Attached(DevicePath),
    Detached(DevicePath),
}

// Local video device inventory, consumed by the controller and path
// integration. Implementations push attach/detach events to subscribers and
// flip ready after their first complete enumeration.
pub trait CameraMonitor: Send + Sync + fmt::Debug {
    fn is_ready(&self) -> bool;
    fn devices(&self) -> Vec<DevicePath>;
    fn subscribe(&self) -> mpsc::UnboundedReceiver<CameraEvent>;
    fn as_runnable(&self) -> &dyn Runnable;
}

static DEVICE_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^video[0-9]+$").unwrap());

// Periodic sweep of the device directory. udev-backed monitors can replace
// this behind the CameraMonitor trait.
#[derive(Debug)]
pub struct PollingMonitor {
    poll_interval: Duration,
    device_directory: PathBuf,

    ready: AtomicBool,
    known: Mutex<HashSet<DevicePath>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CameraEvent>>>,
}
impl PollingMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            device_directory: config.device_directory.clone(),

            ready: AtomicBool::new(false),
            known: Mutex::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn diff(
        known: &HashSet<DevicePath>,
        current: &HashSet<DevicePath>,
    ) -> Vec<CameraEvent> {
        let mut events = Vec::new();
        for device in current.difference(known) {
            events.push(CameraEvent::Attached(device.clone()));
        }
        for device in known.difference(current) {
            events.push(CameraEvent::Detached(device.clone()));
        }
        events
    }

    async fn enumerate(&self) -> Result<HashSet<DevicePath>, Error> {
        let mut devices = HashSet::new();

        let mut read_dir = fs::read_dir(&self.device_directory)
            .await
            .context("read_dir")?;
        while let Some(entry) = read_dir.next_entry().await.context("next_entry")? {
            let file_name = entry.file_name();
            let file_name = match file_name.to_str() {
                Some(file_name) => file_name,
                None => continue,
            };
            if !DEVICE_NAME_PATTERN.is_match(file_name) {
                continue;
            }

            let path = self.device_directory.join(file_name);
            devices.insert(DevicePath::new(path.to_string_lossy().into_owned()));
        }

        Ok(devices)
    }

    fn broadcast(
        &self,
        event: &CameraEvent,
    ) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
    }

    async fn scan_once(&self) -> Result<(), Error> {
        let current = self.enumerate().await.context("enumerate")?;

        let events = {
            let mut known = self.known.lock();
            let events = Self::diff(&known, &current);
            *known = current;
            events
        };

        for event in events.iter() {
            log::info!("{}: {:?}", self, event);
            self.broadcast(event);
        }

        self.ready.store(true, Ordering::Relaxed);

        Ok(())
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        loop {
            if let Err(error) = self.scan_once().await.context("scan_once") {
                log::error!("{}: {:?}", self, error);
            }

            select! {
                () = tokio::time::sleep(self.poll_interval).fuse() => {},
                () = exit_flag => break,
            }
        }

        Exited
    }
}
impl CameraMonitor for PollingMonitor {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
    fn devices(&self) -> Vec<DevicePath> {
        self.known.lock().iter().cloned().collect()
    }
    fn subscribe(&self) -> mpsc::UnboundedReceiver<CameraEvent> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }
    fn as_runnable(&self) -> &dyn Runnable {
        self
    }
}
#[async_trait]
impl Runnable for PollingMonitor {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for PollingMonitor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "PollingMonitor({:?})", self.device_directory)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    // Hand-driven monitor for controller and integration tests.
    #[derive(Debug)]
    pub struct ManualMonitor {
        ready: AtomicBool,
        known: Mutex<HashSet<DevicePath>>,
        subscribers: Mutex<Vec<mpsc::UnboundedSender<CameraEvent>>>,
    }
    impl ManualMonitor {
        pub fn new() -> Self {
            Self {
                ready: AtomicBool::new(false),
                known: Mutex::new(HashSet::new()),
                subscribers: Mutex::new(Vec::new()),
            }
        }

        pub fn set_ready(
            &self,
            ready: bool,
        ) {
            self.ready.store(ready, Ordering::Relaxed);
        }
        pub fn attach(
            &self,
            device: DevicePath,
        ) {
            self.known.lock().insert(device.clone());
            self.subscribers.lock().retain(|subscriber| {
                subscriber
                    .unbounded_send(CameraEvent::Attached(device.clone()))
                    .is_ok()
            });
        }
        pub fn detach(
            &self,
            device: DevicePath,
        ) {
            self.known.lock().remove(&device);
            self.subscribers.lock().retain(|subscriber| {
                subscriber
                    .unbounded_send(CameraEvent::Detached(device.clone()))
                    .is_ok()
            });
        }
    }
    impl CameraMonitor for ManualMonitor {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Relaxed)
        }
        fn devices(&self) -> Vec<DevicePath> {
            self.known.lock().iter().cloned().collect()
        }
        fn subscribe(&self) -> mpsc::UnboundedReceiver<CameraEvent> {
            let (sender, receiver) = mpsc::unbounded();
            self.subscribers.lock().push(sender);
            receiver
        }
        fn as_runnable(&self) -> &dyn Runnable {
            self
        }
    }
    #[async_trait]
    impl Runnable for ManualMonitor {
        async fn run(
            &self,
            exit_flag: async_flag::Receiver,
        ) -> Exited {
            exit_flag.await;
            Exited
        }
    }
}
