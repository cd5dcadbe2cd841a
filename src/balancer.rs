use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::BalancerConfig;
use crate::error::{Error, Result};

// 32-bit FNV-1a, the hash the balancer keys client stickiness on.
const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

fn fnv1a(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

struct Backend {
    address: String,
    healthy: AtomicBool,
}

/// A fixed set of backends with per-backend health, shared between the
/// request path and the health monitor.
///
/// Selection hashes the client's remote address over the healthy subset,
/// so a client keeps hitting the same backend for as long as the healthy
/// set is stable.
pub struct BackendPool {
    backends: Vec<Backend>,
}

impl BackendPool {
    /// Builds a pool. Backends start unhealthy until the first probe
    /// reports on them.
    pub fn new(addresses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let backends = addresses
            .into_iter()
            .map(|address| Backend {
                address: address.into(),
                healthy: AtomicBool::new(false),
            })
            .collect();
        Self { backends }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn address(&self, index: usize) -> &str {
        &self.backends[index].address
    }

    pub fn is_healthy(&self, index: usize) -> bool {
        self.backends[index].healthy.load(Ordering::SeqCst)
    }

    pub fn healthy_count(&self) -> usize {
        self.backends
            .iter()
            .filter(|b| b.healthy.load(Ordering::SeqCst))
            .count()
    }

    /// Records a probe result, returning the previous state.
    pub fn set_healthy(&self, index: usize, healthy: bool) -> bool {
        self.backends[index].healthy.swap(healthy, Ordering::SeqCst)
    }

    /// Picks a healthy backend for a client address, or `None` when no
    /// backend is healthy (the proxy answers 503 in that case).
    pub fn select(&self, client_addr: &str) -> Option<&str> {
        let healthy: Vec<&Backend> = self
            .backends
            .iter()
            .filter(|b| b.healthy.load(Ordering::SeqCst))
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let index = fnv1a(client_addr.as_bytes()) as usize % healthy.len();
        Some(&healthy[index].address)
    }
}

/// Answers whether one backend is currently healthy.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str) -> bool;
}

/// Probes `GET http://<address>/health`; healthy iff the reply is 200.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Prober for HttpProber {
    async fn probe(&self, address: &str) -> bool {
        let url = format!("http://{address}/health");
        match self.client.get(&url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }
}

/// Background probing of the pool, one task per backend.
///
/// Every backend runs on its own clock, first probe immediate, so a slow
/// or unresponsive backend delays only its own next probe and never the
/// cadence of the others.
pub struct HealthMonitor {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn start(
        pool: Arc<BackendPool>,
        prober: Arc<dyn Prober>,
        config: &BalancerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut handles = Vec::with_capacity(pool.len());
        for index in 0..pool.len() {
            handles.push(Self::spawn_probe_loop(
                Arc::clone(&pool),
                Arc::clone(&prober),
                index,
                config.probe_interval,
                shutdown_tx.subscribe(),
            ));
        }

        Self {
            shutdown_tx,
            handles,
        }
    }

    fn spawn_probe_loop(
        pool: Arc<BackendPool>,
        prober: Arc<dyn Prober>,
        index: usize,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let healthy = prober.probe(pool.address(index)).await;
                        let was = pool.set_healthy(index, healthy);
                        if was != healthy {
                            tracing::info!(
                                backend = pool.address(index),
                                healthy,
                                "backend health changed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::debug!(backend = pool.address(index), "probe loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stops every probe loop and waits for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        for handle in self.handles {
            handle.await?;
        }
        Ok(())
    }
}

/// The in-process half of the reverse proxy: a probed backend pool and
/// sticky backend selection. Forwarding the request itself is the HTTP
/// server's business.
pub struct Balancer {
    pool: Arc<BackendPool>,
    monitor: HealthMonitor,
}

impl Balancer {
    /// Builds the pool from the configured backends and starts the health
    /// monitor with the given prober.
    pub fn start(config: BalancerConfig, prober: Arc<dyn Prober>) -> Self {
        let pool = Arc::new(BackendPool::new(config.backends.iter().cloned()));
        let monitor = HealthMonitor::start(Arc::clone(&pool), prober, &config);
        Self { pool, monitor }
    }

    /// Like [`start`], probing over plain HTTP.
    ///
    /// [`start`]: Balancer::start
    pub fn start_http(config: BalancerConfig) -> Result<Self> {
        let prober = Arc::new(HttpProber::new(config.probe_timeout)?);
        Ok(Self::start(config, prober))
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Picks a healthy backend for a client address.
    pub fn select(&self, client_addr: &str) -> Option<&str> {
        self.pool.select(client_addr)
    }

    pub async fn shutdown(self) -> Result<()> {
        self.monitor.shutdown().await
    }
}
