//! Twin directory access and the peer HTTP transport.
//!
//! A twin is an integer identity with a network location and a public key.
//! The relay only sees the [`TwinResolver`] trait; behind it sits either the
//! static table resolver here or an external directory (the on-chain one is
//! deliberately not part of this crate). [`CachedResolver`] wraps any of
//! them with a TTL cache so hot destinations don't hammer the directory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::config::TwinEntry;
use crate::message::Message;

/// Port every node's gateway listens on.
pub const PEER_PORT: u16 = 8051;

/// How long directory answers stay cached.
pub const RESOLVER_CACHE_TTL: Duration = Duration::from_secs(300);

/// Timeout for posting a request to a peer.
const SEND_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

fn remote_url(location: &str) -> String {
    format!("http://{location}:{PEER_PORT}/zbus-remote")
}

fn reply_url(location: &str) -> String {
    format!("http://{location}:{PEER_PORT}/zbus-reply")
}

/// Directory lookup failures, split so the gateway can map them onto
/// different HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("twin {0} not found")]
    NotFound(u32),
    #[error("twin lookup failed: {0}")]
    Transport(String),
}

/// Transport handle to one remote peer.
#[async_trait]
pub trait TwinClient: Send + Sync {
    async fn send_remote(&self, msg: &Message) -> Result<()>;
    async fn send_reply(&self, msg: &Message) -> Result<()>;
}

/// Maps a twin id to its transport and its public key.
#[async_trait]
pub trait TwinResolver: Send + Sync {
    async fn resolve(&self, twin: u32) -> Result<Arc<dyn TwinClient>, ResolveError>;
    async fn public_key(&self, twin: u32) -> Result<Vec<u8>, ResolveError>;
}

/// Error body peers return alongside non-2xx statuses.
#[derive(Deserialize)]
struct PeerErrorBody {
    #[allow(dead_code)]
    status: String,
    message: String,
}

/// Posts messages to a peer gateway over plain HTTP.
pub struct HttpTwinClient {
    location: String,
    http: reqwest::Client,
}

impl HttpTwinClient {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, url: String, msg: &Message, timeout: Option<Duration>) -> Result<()> {
        let mut request = self.http.post(&url).json(msg);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
            let detail = serde_json::from_str::<PeerErrorBody>(&body)
                .map(|b| b.message)
                .unwrap_or(body);
            anyhow::bail!("peer rejected message ({status}): {detail}");
        }
        Ok(())
    }
}

#[async_trait]
impl TwinClient for HttpTwinClient {
    async fn send_remote(&self, msg: &Message) -> Result<()> {
        self.post(remote_url(&self.location), msg, Some(SEND_REMOTE_TIMEOUT))
            .await
    }

    async fn send_reply(&self, msg: &Message) -> Result<()> {
        self.post(reply_url(&self.location), msg, None).await
    }
}

/// Resolver backed by a fixed twin table from the config file. The offline
/// alternative to a networked directory; handy for lab setups.
pub struct StaticResolver {
    twins: HashMap<u32, TwinEntry>,
}

impl StaticResolver {
    pub fn new(entries: impl IntoIterator<Item = TwinEntry>) -> Self {
        Self {
            twins: entries.into_iter().map(|e| (e.id, e)).collect(),
        }
    }
}

#[async_trait]
impl TwinResolver for StaticResolver {
    async fn resolve(&self, twin: u32) -> Result<Arc<dyn TwinClient>, ResolveError> {
        let entry = self.twins.get(&twin).ok_or(ResolveError::NotFound(twin))?;
        Ok(Arc::new(HttpTwinClient::new(entry.location.clone())))
    }

    async fn public_key(&self, twin: u32) -> Result<Vec<u8>, ResolveError> {
        let entry = self.twins.get(&twin).ok_or(ResolveError::NotFound(twin))?;
        let key_hex = entry
            .public_key
            .as_deref()
            .ok_or(ResolveError::NotFound(twin))?;
        hex::decode(key_hex.trim_start_matches("0x"))
            .map_err(|e| ResolveError::Transport(format!("bad public key for twin {twin}: {e}")))
    }
}

struct CacheEntry<T> {
    value: T,
    deadline: Instant,
}

/// TTL cache in front of an authoritative resolver. Clients and public keys
/// are cached independently; entries are evicted lazily on lookup. Errors
/// are never cached.
pub struct CachedResolver {
    inner: Arc<dyn TwinResolver>,
    ttl: Duration,
    clients: Mutex<HashMap<u32, CacheEntry<Arc<dyn TwinClient>>>>,
    keys: Mutex<HashMap<u32, CacheEntry<Vec<u8>>>>,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn TwinResolver>) -> Self {
        Self::with_ttl(inner, RESOLVER_CACHE_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn TwinResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            clients: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn fresh<T: Clone>(cache: &Mutex<HashMap<u32, CacheEntry<T>>>, twin: u32) -> Option<T> {
        let mut cache = cache.lock();
        let now = Instant::now();
        if let Some(entry) = cache.get(&twin) {
            if now >= entry.deadline {
                cache.remove(&twin);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }

    fn store<T>(&self, cache: &Mutex<HashMap<u32, CacheEntry<T>>>, twin: u32, value: T) {
        cache.lock().insert(
            twin,
            CacheEntry {
                value,
                deadline: Instant::now() + self.ttl,
            },
        );
    }
}

#[async_trait]
impl TwinResolver for CachedResolver {
    async fn resolve(&self, twin: u32) -> Result<Arc<dyn TwinClient>, ResolveError> {
        if let Some(client) = Self::fresh(&self.clients, twin) {
            tracing::debug!("twin {twin} client cache hit");
            return Ok(client);
        }
        let client = self.inner.resolve(twin).await?;
        self.store(&self.clients, twin, Arc::clone(&client));
        Ok(client)
    }

    async fn public_key(&self, twin: u32) -> Result<Vec<u8>, ResolveError> {
        if let Some(key) = Self::fresh(&self.keys, twin) {
            tracing::debug!("twin {twin} public key cache hit");
            return Ok(key);
        }
        let key = self.inner.public_key(twin).await?;
        self.store(&self.keys, twin, key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn peer_urls_use_the_gateway_port_and_routes() {
        assert_eq!(remote_url("10.0.0.2"), "http://10.0.0.2:8051/zbus-remote");
        assert_eq!(reply_url("10.0.0.2"), "http://10.0.0.2:8051/zbus-reply");
    }

    fn entry(id: u32, location: &str, public_key: Option<&str>) -> TwinEntry {
        TwinEntry {
            id,
            location: location.into(),
            public_key: public_key.map(String::from),
        }
    }

    #[tokio::test]
    async fn static_resolver_finds_configured_twins() {
        let resolver = StaticResolver::new([entry(2, "10.0.0.2", Some("ab"))]);
        assert!(resolver.resolve(2).await.is_ok());
        assert_eq!(resolver.public_key(2).await.unwrap(), vec![0xab]);
    }

    #[tokio::test]
    async fn static_resolver_reports_unknown_twins() {
        let resolver = StaticResolver::new([entry(2, "10.0.0.2", None)]);
        assert!(matches!(
            resolver.resolve(3).await,
            Err(ResolveError::NotFound(3))
        ));
        // configured but without a key: also a miss, not a transport error
        assert!(matches!(
            resolver.public_key(2).await,
            Err(ResolveError::NotFound(2))
        ));
    }

    struct CountingResolver {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl TwinResolver for CountingResolver {
        async fn resolve(&self, twin: u32) -> Result<Arc<dyn TwinClient>, ResolveError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(HttpTwinClient::new(format!("10.0.0.{twin}"))))
        }

        async fn public_key(&self, _twin: u32) -> Result<Vec<u8>, ResolveError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1; 32])
        }
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups_without_hitting_the_directory() {
        let inner = Arc::new(CountingResolver {
            hits: AtomicUsize::new(0),
        });
        let cached = CachedResolver::new(Arc::clone(&inner) as Arc<dyn TwinResolver>);

        cached.resolve(2).await.unwrap();
        cached.resolve(2).await.unwrap();
        cached.public_key(2).await.unwrap();
        cached.public_key(2).await.unwrap();

        assert_eq!(inner.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_entries_expire_after_the_ttl() {
        let inner = Arc::new(CountingResolver {
            hits: AtomicUsize::new(0),
        });
        let cached = CachedResolver::with_ttl(
            Arc::clone(&inner) as Arc<dyn TwinResolver>,
            Duration::from_millis(20),
        );

        cached.resolve(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cached.resolve(2).await.unwrap();

        assert_eq!(inner.hits.load(Ordering::SeqCst), 2);
    }
}
