//! Endpoint discovery and selection policies.
//!
//! A discovery is an abstract set of server endpoints with a selection
//! policy. The plain [`MultiServersDiscovery`] holds a hand-maintained
//! list; [`RegistryDiscovery`] keeps the list fresh from a heartbeat
//! registry, re-fetching it over HTTP once the cached copy goes stale.
//!
//! Endpoints are strings of the form `tcp@127.0.0.1:9001` (or `http@...`
//! for tunnelled servers).

use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::registry::SERVERS_HEADER;

/// How a single endpoint is picked out of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-fetches the endpoint set from its source, if there is one.
    async fn refresh(&self) -> Result<()>;

    /// Replaces the endpoint set.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Selects one endpoint by policy.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// Returns a copy of the whole endpoint set.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct Picker {
    servers: Vec<String>,
    index: usize,
    rng: StdRng,
}

/// A discovery over a fixed, manually updated endpoint list.
pub struct MultiServersDiscovery {
    inner: RwLock<Picker>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        // start round robin at a random offset so replicas sharing this
        // code do not all hammer the first endpoint
        let index = rng.gen_range(0..i32::MAX as usize);
        MultiServersDiscovery {
            inner: RwLock::new(Picker { servers, index, rng }),
        }
    }

    fn pick(&self, mode: SelectMode) -> Result<String> {
        let mut picker = self.inner.write().expect("discovery lock poisoned");
        let n = picker.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let i = picker.rng.gen_range(0..n);
                Ok(picker.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                let server = picker.servers[picker.index % n].clone();
                picker.index = (picker.index + 1) % n;
                Ok(server)
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.inner.read().expect("discovery lock poisoned").servers.clone()
    }

    fn replace(&self, servers: Vec<String>) {
        self.inner.write().expect("discovery lock poisoned").servers = servers;
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.replace(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.snapshot())
    }
}

const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A discovery backed by a heartbeat registry. The endpoint set is
/// cached and only re-fetched once it is older than `timeout`.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    http: reqwest::Client,
    timeout: Duration,
    last_update: Mutex<Option<Instant>>,
}

impl RegistryDiscovery {
    /// `timeout` of zero selects the 10 s default.
    pub fn new(registry_url: &str, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() { DEFAULT_UPDATE_TIMEOUT } else { timeout };
        RegistryDiscovery {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry: registry_url.to_string(),
            http: reqwest::Client::new(),
            timeout,
            last_update: Mutex::new(None),
        }
    }

    fn is_fresh(&self) -> bool {
        self.last_update
            .lock()
            .expect("discovery timestamp lock poisoned")
            .map(|t| t.elapsed() < self.timeout)
            .unwrap_or(false)
    }

    fn stamp(&self) {
        *self.last_update.lock().expect("discovery timestamp lock poisoned") =
            Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        if self.is_fresh() {
            return Ok(());
        }
        debug!("rpc registry: refresh servers from registry {}", self.registry);
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|e| RpcError::Registry(e.to_string()))?;
        let raw = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let servers = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self.servers.replace(servers);
        self.stamp();
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.replace(servers);
        self.stamp();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        Ok(self.servers.snapshot())
    }
}
