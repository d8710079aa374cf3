//! Cached view of the provider's signing keys.
//!
//! ```text
//! get_key(kid)
//!   → snapshot hit and fresh?            → key
//!   → stale hit and a fetch in flight?   → last-known-good key (serve_stale)
//!   → wait for the fetch guard (bounded by fetch_timeout)
//!   → another caller fetched meanwhile?  → answer from its result
//!   → over the per-minute refetch cap?   → stale key, else RateLimited
//!   → fetch full set, swap map atomically → key or NotFound
//! ```
//!
//! The snapshot lock is never held across the network call; only the fetch
//! guard is, and every wait on it is bounded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::error::KeyLookupError;
use crate::jwks::{KeySetSource, SigningKey, signing_keys};

/// Default snapshot TTL (10 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Default refetch cap per rolling minute.
pub const DEFAULT_FETCHES_PER_MINUTE: u32 = 5;

/// Default bound on a single key-set fetch, and on waiting for one.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct KeyCacheOptions {
    /// How long a fetched set is trusted. `None` keeps it until a miss.
    pub ttl: Option<Duration>,
    /// Refetch cap within any rolling 60 s window.
    pub max_fetches_per_minute: u32,
    pub fetch_timeout: Duration,
    /// Serve an expired-but-present key while another caller refreshes.
    pub serve_stale: bool,
}

impl Default for KeyCacheOptions {
    fn default() -> Self {
        Self {
            ttl: Some(DEFAULT_CACHE_TTL),
            max_fetches_per_minute: DEFAULT_FETCHES_PER_MINUTE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            serve_stale: true,
        }
    }
}

#[derive(Default)]
struct Snapshot {
    keys: Arc<HashMap<String, SigningKey>>,
    refreshed_at: Option<Instant>,
    invalidated: bool,
}

/// State owned by whoever holds the fetch guard.
#[derive(Default)]
struct FetchState {
    history: VecDeque<Instant>,
    last_error: Option<KeyLookupError>,
}

/// Single-flight, rate-limited cache of the provider's signing keys.
pub struct KeySetCache<S> {
    source: S,
    options: KeyCacheOptions,
    snapshot: RwLock<Snapshot>,
    fetch: Mutex<FetchState>,
    /// Completed fetch attempts, bumped while the fetch guard is held.
    attempts: AtomicU64,
}

impl<S: KeySetSource> KeySetCache<S> {
    #[must_use]
    pub fn new(source: S) -> Self {
        Self::with_options(source, KeyCacheOptions::default())
    }

    #[must_use]
    pub fn with_options(source: S, options: KeyCacheOptions) -> Self {
        Self {
            source,
            options,
            snapshot: RwLock::new(Snapshot::default()),
            fetch: Mutex::new(FetchState::default()),
            attempts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &KeyCacheOptions {
        &self.options
    }

    /// Resolve a signing key by key ID.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the freshly fetched set has no such key
    /// - `RateLimited` if a refetch was needed but the cap is exhausted and
    ///   no last-known key exists
    /// - `FetchFailed` or `Timeout` if the fetch failed and no last-known
    ///   key exists
    pub async fn get_key(&self, kid: &str) -> Result<SigningKey, KeyLookupError> {
        let seen_attempts = self.attempts.load(Ordering::Acquire);
        let (cached, fresh) = {
            let snapshot = self.snapshot.read().await;
            (snapshot.keys.get(kid).cloned(), self.is_fresh(&snapshot))
        };

        if let Some(key) = &cached
            && fresh
        {
            return Ok(key.clone());
        }

        let mut state = if let Some(key) = cached.as_ref().filter(|_| self.options.serve_stale) {
            match self.fetch.try_lock() {
                Ok(state) => state,
                Err(_) => {
                    tracing::debug!(kid, "key set refreshing; serving last-known key");
                    return Ok(key.clone());
                }
            }
        } else {
            match tokio::time::timeout(self.options.fetch_timeout, self.fetch.lock()).await {
                Ok(state) => state,
                Err(_) => {
                    tracing::warn!(kid, "timed out waiting for in-flight key-set fetch");
                    return cached.ok_or(KeyLookupError::Timeout);
                }
            }
        };

        if self.attempts.load(Ordering::Acquire) != seen_attempts {
            // Someone else fetched while we waited: share their outcome.
            let snapshot = self.snapshot.read().await;
            if let Some(key) = snapshot.keys.get(kid) {
                return Ok(key.clone());
            }
            if let Some(error) = state.last_error.clone() {
                return cached.ok_or(error);
            }
            if self.is_fresh(&snapshot) {
                return Err(KeyLookupError::NotFound);
            }
        }

        self.refresh_locked(&mut state, kid, cached).await
    }

    /// Force the next lookup to refetch (for example after a known rotation).
    pub async fn invalidate(&self) {
        self.snapshot.write().await.invalidated = true;
        tracing::debug!("key set cache invalidated");
    }

    /// Fetch the key set ahead of the first request.
    ///
    /// # Errors
    ///
    /// Returns the fetch error; the cache stays empty.
    pub async fn prefetch(&self) -> Result<usize, KeyLookupError> {
        let mut state = self.fetch.lock().await;
        match self.refresh_locked(&mut state, "", None).await {
            Ok(_) | Err(KeyLookupError::NotFound) => Ok(self.len().await),
            Err(error) => Err(error),
        }
    }

    /// Number of keys in the current snapshot.
    pub async fn len(&self) -> usize {
        self.snapshot.read().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        let Some(refreshed_at) = snapshot.refreshed_at else {
            return false;
        };
        !snapshot.invalidated && self.options.ttl.is_none_or(|ttl| refreshed_at.elapsed() < ttl)
    }

    /// Fetch and swap in a new key set. Caller holds the fetch guard.
    async fn refresh_locked(
        &self,
        state: &mut FetchState,
        kid: &str,
        fallback: Option<SigningKey>,
    ) -> Result<SigningKey, KeyLookupError> {
        let now = Instant::now();
        while state
            .history
            .front()
            .is_some_and(|at| now.duration_since(*at) >= RATE_WINDOW)
        {
            state.history.pop_front();
        }

        if state.history.len() >= self.options.max_fetches_per_minute as usize {
            tracing::warn!(
                kid,
                limit = self.options.max_fetches_per_minute,
                "JWKS refetch rate limit reached; not fetching"
            );
            return fallback.ok_or(KeyLookupError::RateLimited);
        }
        state.history.push_back(now);

        let outcome = match tokio::time::timeout(self.options.fetch_timeout, self.source.fetch()).await
        {
            Ok(Ok(set)) => {
                let keys = signing_keys(&set, Utc::now());
                if keys.is_empty() {
                    Err(KeyLookupError::FetchFailed(
                        "no usable RS256 signing keys in JWKS".into(),
                    ))
                } else {
                    Ok(keys)
                }
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(KeyLookupError::Timeout),
        };

        let result = match outcome {
            Ok(keys) => {
                let found = keys.get(kid).cloned();
                let count = keys.len();
                {
                    let mut snapshot = self.snapshot.write().await;
                    *snapshot = Snapshot {
                        keys: Arc::new(keys),
                        refreshed_at: Some(Instant::now()),
                        invalidated: false,
                    };
                }
                state.last_error = None;
                tracing::info!(key_count = count, "JWKS cache refreshed");
                found.ok_or(KeyLookupError::NotFound)
            }
            Err(error) => {
                tracing::warn!(%error, kid, "JWKS fetch failed; keeping existing key set");
                state.last_error = Some(error.clone());
                fallback.ok_or(error)
            }
        };

        self.attempts.fetch_add(1, Ordering::Release);
        result
    }
}
