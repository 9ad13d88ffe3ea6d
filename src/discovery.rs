use crate::{
    config::{ConfigStore, DiscoveryConfig},
    errors::ControllerError,
    util::{
        async_flag,
        runnable::{Exited, Runnable},
    },
};
use anyhow::{Context, Error, anyhow, bail};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, select, stream};
use itertools::iproduct;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::net::TcpStream;

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    SkydioStanag4609,
    GenericRtsp,
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Discovered,
    Added,
    Connected,
    Error,
    Disconnected,
}

// Discovered non-local source, keyed by URL.
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct ExternalStream {
    pub url: String,
    pub kind: StreamKind,
    pub name: String,
    pub status: StreamStatus,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub capabilities: serde_json::Value,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct DiscoveryResult {
    pub found: Vec<ExternalStream>,
    pub scanned: usize,
}

#[derive(Clone, PartialEq, Eq, Debug)]
struct Candidate {
    address: IpAddr,
    port: u16,
    path: String,
    kind: StreamKind,
}
impl Candidate {
    fn url(&self) -> String {
        format!("rtsp://{}:{}{}", self.address, self.port, self.path)
    }
    fn name(&self) -> String {
        match self.kind {
            StreamKind::SkydioStanag4609 => format!("skydio-{}", self.address),
            StreamKind::GenericRtsp => format!("rtsp-{}-{}", self.address, self.port),
        }
    }
}

// Lexicographic byte carry over the four octets.
fn increment_octets(mut octets: [u8; 4]) -> Option<[u8; 4]> {
    for position in (0..4).rev() {
        if octets[position] < u8::MAX {
            octets[position] += 1;
            return Some(octets);
        }
        octets[position] = 0;
    }
    None
}

// Expands `a.b.c.d/len` to host addresses in ascending order; network and
// broadcast addresses are skipped.
fn expand_cidr(range: &str) -> Result<Vec<Ipv4Addr>, Error> {
    let (address, prefix_length) = range
        .split_once('/')
        .ok_or_else(|| anyhow!("missing prefix length: {range}"))?;

    let address: Ipv4Addr = address.parse().context("address")?;
    let prefix_length: u32 = prefix_length.parse().context("prefix_length")?;
    if prefix_length > 32 {
        bail!("invalid prefix length: {prefix_length}");
    }

    let mask: u32 = if prefix_length == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_length)
    };
    let network = u32::from(address) & mask;
    let broadcast = network | !mask;

    let mut addresses = Vec::new();
    let mut octets = Ipv4Addr::from(network).octets();
    loop {
        octets = match increment_octets(octets) {
            Some(octets) => octets,
            None => break,
        };

        let current = u32::from(Ipv4Addr::from(octets));
        if current >= broadcast {
            break;
        }
        addresses.push(Ipv4Addr::from(octets));
    }

    Ok(addresses)
}

fn candidates_for_address(
    config: &DiscoveryConfig,
    address: IpAddr,
) -> Vec<Candidate> {
    let skydio = iproduct!(config.skydio_ports.iter(), config.skydio_paths.iter()).map(
        |(port, path)| Candidate {
            address,
            port: *port,
            path: path.clone(),
            kind: StreamKind::SkydioStanag4609,
        },
    );
    let generic = iproduct!(config.generic_ports.iter(), config.generic_paths.iter()).map(
        |(port, path)| Candidate {
            address,
            port: *port,
            path: path.clone(),
            kind: StreamKind::GenericRtsp,
        },
    );

    skydio.chain(generic).collect()
}

// RTSP source discovery: known addresses are probed before range sweeps, and
// range sweeps are skipped entirely once a Skydio-family stream answered.
// A connect-level probe is sufficient to advertise the candidate.
pub struct ExternalStreamDiscovery {
    config_store: std::sync::Arc<ConfigStore>,

    streams: Mutex<HashMap<String, ExternalStream>>,
    scan_in_progress: AtomicBool,
}
impl ExternalStreamDiscovery {
    pub fn new(config_store: std::sync::Arc<ConfigStore>) -> Self {
        Self {
            config_store,

            streams: Mutex::new(HashMap::new()),
            scan_in_progress: AtomicBool::new(false),
        }
    }

    pub fn scan_in_progress(&self) -> bool {
        self.scan_in_progress.load(Ordering::Acquire)
    }

    async fn probe(
        candidate: Candidate,
        timeout: Duration,
    ) -> Option<Candidate> {
        let address = SocketAddr::new(candidate.address, candidate.port);
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => Some(candidate),
            _ => None,
        }
    }

    async fn probe_all(
        &self,
        candidates: Vec<Candidate>,
        config: &DiscoveryConfig,
    ) -> Vec<Candidate> {
        stream::iter(candidates)
            .map(|candidate| Self::probe(candidate, config.scan_timeout))
            .buffer_unordered(config.max_concurrent_probes.max(1))
            .filter_map(|found| async move { found })
            .collect()
            .await
    }

    fn register(
        &self,
        found: &[Candidate],
    ) -> Vec<ExternalStream> {
        let now = Utc::now();
        let mut streams = self.streams.lock();

        found
            .iter()
            .map(|candidate| {
                let url = candidate.url();
                streams
                    .entry(url.clone())
                    .and_modify(|stream| stream.last_seen = now)
                    .or_insert_with(|| ExternalStream {
                        url,
                        kind: candidate.kind,
                        name: candidate.name(),
                        status: StreamStatus::Discovered,
                        discovered_at: now,
                        last_seen: now,
                        capabilities: serde_json::json!({
                            "port": candidate.port,
                            "path": candidate.path,
                        }),
                    })
                    .clone()
            })
            .collect()
    }

    async fn scan(
        &self,
        config: &DiscoveryConfig,
    ) -> Result<DiscoveryResult, Error> {
        let mut scanned: usize = 0;
        let mut found_candidates = Vec::new();

        // known addresses first
        let known_candidates = config
            .known_ips
            .iter()
            .flat_map(|address| candidates_for_address(config, *address))
            .collect::<Vec<Candidate>>();
        scanned += known_candidates.len();
        found_candidates.extend(self.probe_all(known_candidates, config).await);

        // a responding Skydio makes the range sweep redundant
        let skydio_found = found_candidates
            .iter()
            .any(|candidate| candidate.kind == StreamKind::SkydioStanag4609);

        if !skydio_found {
            for range in config.cidr_ranges.iter() {
                let addresses = expand_cidr(range).context("expand_cidr")?;
                let range_candidates = addresses
                    .into_iter()
                    .map(IpAddr::V4)
                    .filter(|address| !config.known_ips.contains(address))
                    .flat_map(|address| candidates_for_address(config, address))
                    .collect::<Vec<Candidate>>();
                scanned += range_candidates.len();
                found_candidates.extend(self.probe_all(range_candidates, config).await);
            }
        }

        let found = self.register(&found_candidates);

        Ok(DiscoveryResult { found, scanned })
    }

    // Single-flight: a concurrent call is rejected instead of queued.
    pub async fn discover(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Result<DiscoveryResult, ControllerError> {
        if self
            .scan_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ControllerError::AlreadyExists {
                kind: "scan",
                name: "external-discovery".to_owned(),
            });
        }
        let _guard = scopeguard::guard((), |()| {
            self.scan_in_progress.store(false, Ordering::Release);
        });

        let config = self.config_store.snapshot().discovery;

        let scan = self.scan(&config);
        futures::pin_mut!(scan);
        let mut scan = scan.fuse();

        select! {
            result = scan => result.map_err(ControllerError::Internal),
            () = exit_flag => Err(ControllerError::Internal(anyhow!(
                "discovery scan cancelled"
            ))),
        }
    }

    pub fn streams(&self) -> Vec<ExternalStream> {
        let mut streams = self
            .streams
            .lock()
            .values()
            .cloned()
            .collect::<Vec<ExternalStream>>();
        streams.sort_by(|left, right| left.url.cmp(&right.url));
        streams
    }
    pub fn get_stream(
        &self,
        url: &str,
    ) -> Option<ExternalStream> {
        self.streams.lock().get(url).cloned()
    }
    pub fn add_stream(
        &self,
        stream: ExternalStream,
    ) -> Result<(), ControllerError> {
        let mut streams = self.streams.lock();
        if streams.contains_key(&stream.url) {
            return Err(ControllerError::AlreadyExists {
                kind: "external stream",
                name: stream.url,
            });
        }
        streams.insert(stream.url.clone(), stream);
        Ok(())
    }
    pub fn remove_stream(
        &self,
        url: &str,
    ) -> Result<ExternalStream, ControllerError> {
        self.streams
            .lock()
            .remove(url)
            .ok_or_else(|| ControllerError::NotFound {
                kind: "external stream",
                name: url.to_owned(),
            })
    }

    // Polls the in-progress flag until the current scan unwinds or the
    // budget runs out.
    pub async fn wait_idle(
        &self,
        timeout: Duration,
    ) -> Result<(), Error> {
        const POLL_INTERVAL: Duration = Duration::from_millis(10);

        let deadline = tokio::time::Instant::now() + timeout;
        while self.scan_in_progress() {
            if tokio::time::Instant::now() >= deadline {
                bail!("discovery scan did not stop within {:?}", timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Ok(())
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        loop {
            let config = self.config_store.snapshot().discovery;
            if !config.enabled {
                exit_flag.clone().await;
                break;
            }

            select! {
                () = tokio::time::sleep(config.scan_interval).fuse() => {},
                () = exit_flag => break,
            }

            match self.discover(exit_flag.clone()).await {
                Ok(result) => {
                    log::debug!(
                        "{}: scan finished: {} found / {} scanned",
                        self,
                        result.found.len(),
                        result.scanned
                    );
                }
                Err(ControllerError::AlreadyExists { .. }) => {}
                Err(error) => {
                    log::error!("{}: scan failed: {}", self, error);
                }
            }
        }

        Exited
    }
}
#[async_trait::async_trait]
impl Runnable for ExternalStreamDiscovery {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for ExternalStreamDiscovery {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "ExternalStreamDiscovery")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn discovery_with(discovery_config: DiscoveryConfig) -> ExternalStreamDiscovery {
        let mut config = Config::default();
        config.discovery = discovery_config;
        let config_store = Arc::new(ConfigStore::new(config).unwrap());
        ExternalStreamDiscovery::new(config_store)
    }

    fn sample_stream(url: &str) -> ExternalStream {
        let now = Utc::now();
        ExternalStream {
            url: url.to_owned(),
            kind: StreamKind::GenericRtsp,
            name: "sample".to_owned(),
            status: StreamStatus::Added,
            discovered_at: now,
            last_seen: now,
            capabilities: serde_json::Value::Null,
        }
    }

    #[test]
    fn octet_carry() {
        assert_eq!(increment_octets([10, 0, 0, 1]), Some([10, 0, 0, 2]));
        assert_eq!(increment_octets([10, 0, 0, 255]), Some([10, 0, 1, 0]));
        assert_eq!(increment_octets([10, 255, 255, 255]), Some([11, 0, 0, 0]));
        assert_eq!(increment_octets([255, 255, 255, 255]), None);
    }

    #[test]
    fn cidr_expansion_order_and_bounds() {
        let addresses = expand_cidr("192.168.1.0/30").unwrap();
        assert_eq!(
            addresses,
            vec![
                Ipv4Addr::new(192, 168, 1, 1),
                Ipv4Addr::new(192, 168, 1, 2),
            ]
        );

        let addresses = expand_cidr("10.0.0.0/24").unwrap();
        assert_eq!(addresses.len(), 254);
        assert_eq!(addresses[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(addresses[253], Ipv4Addr::new(10, 0, 0, 254));

        assert!(expand_cidr("10.0.0.0").is_err());
        assert!(expand_cidr("10.0.0.0/33").is_err());
    }

    #[tokio::test]
    async fn discovers_a_responding_skydio_endpoint() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let discovery = discovery_with(DiscoveryConfig {
            known_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            skydio_ports: vec![port],
            skydio_paths: vec!["/skydio".to_owned()],
            generic_ports: Vec::new(),
            generic_paths: Vec::new(),
            scan_timeout: Duration::from_millis(500),
            ..DiscoveryConfig::default()
        });

        let (_sender, exit_flag) = async_flag::pair();
        let result = discovery.discover(exit_flag).await.unwrap();

        assert_eq!(result.scanned, 1);
        assert_eq!(result.found.len(), 1);
        assert_eq!(result.found[0].kind, StreamKind::SkydioStanag4609);
        assert_eq!(
            result.found[0].url,
            format!("rtsp://127.0.0.1:{port}/skydio")
        );
        assert_eq!(result.found[0].status, StreamStatus::Discovered);

        // registered in the stream map
        assert!(discovery.get_stream(&result.found[0].url).is_some());
    }

    #[tokio::test]
    async fn known_skydio_short_circuits_range_scan() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let discovery = discovery_with(DiscoveryConfig {
            known_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            cidr_ranges: vec!["192.0.2.0/30".to_owned()],
            skydio_ports: vec![port],
            skydio_paths: vec!["/skydio".to_owned()],
            generic_ports: Vec::new(),
            generic_paths: Vec::new(),
            scan_timeout: Duration::from_millis(50),
            ..DiscoveryConfig::default()
        });

        let (_sender, exit_flag) = async_flag::pair();
        let result = discovery.discover(exit_flag).await.unwrap();

        // only the known address was probed; the range stayed untouched
        assert_eq!(result.scanned, 1);
    }

    #[tokio::test]
    async fn concurrent_scan_is_rejected() {
        let discovery = discovery_with(DiscoveryConfig::default());

        discovery.scan_in_progress.store(true, Ordering::Release);

        let (_sender, exit_flag) = async_flag::pair();
        let error = discovery.discover(exit_flag).await.unwrap_err();
        assert!(matches!(
            error,
            ControllerError::AlreadyExists { kind: "scan", .. }
        ));
    }

    #[tokio::test]
    async fn cancellation_unwinds_and_resets_the_flag() {
        let discovery = Arc::new(discovery_with(DiscoveryConfig {
            // unroutable test network: probes run into the timeout
            cidr_ranges: vec!["192.0.2.0/24".to_owned()],
            scan_timeout: Duration::from_secs(10),
            max_concurrent_probes: 4,
            ..DiscoveryConfig::default()
        }));

        let (sender, exit_flag) = async_flag::pair();

        let scan = {
            let discovery = discovery.clone();
            tokio::spawn(async move { discovery.discover(exit_flag).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.signal();

        let result = scan.await.unwrap();
        assert!(result.is_err());

        discovery
            .wait_idle(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!discovery.scan_in_progress());
    }

    #[tokio::test]
    async fn add_remove_round_trip_is_a_no_op() {
        let discovery = discovery_with(DiscoveryConfig::default());

        let before = discovery.streams();

        discovery
            .add_stream(sample_stream("rtsp://10.0.0.7:554/live"))
            .unwrap();
        assert_eq!(discovery.streams().len(), 1);

        let duplicate = discovery.add_stream(sample_stream("rtsp://10.0.0.7:554/live"));
        assert!(matches!(
            duplicate,
            Err(ControllerError::AlreadyExists { .. })
        ));

        discovery.remove_stream("rtsp://10.0.0.7:554/live").unwrap();
        assert_eq!(discovery.streams(), before);

        let missing = discovery.remove_stream("rtsp://10.0.0.7:554/live");
        assert!(matches!(missing, Err(ControllerError::NotFound { .. })));
    }
}
