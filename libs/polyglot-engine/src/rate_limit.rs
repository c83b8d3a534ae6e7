use polyglot_common::config::{RateLimitConfig, RateLimitKey};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identity a request is charged to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Key for a caller under the configured keying mode.
    ///
    /// `ip` is the peer address when known; `api_key` the `x-api-key`
    /// header value when present.
    pub fn resolve(mode: RateLimitKey, ip: Option<&str>, api_key: Option<&str>) -> Self {
        let ip = ip.filter(|s| !s.is_empty()).unwrap_or("unknown");
        match mode {
            RateLimitKey::Global => ClientKey("global".to_string()),
            RateLimitKey::Ip => ClientKey(format!("ip:{}", ip)),
            RateLimitKey::ApiKey => match api_key.map(str::trim).filter(|k| !k.is_empty()) {
                Some(key) => ClientKey(format!("key:{}", key)),
                None => ClientKey(format!("ip:{}", ip)),
            },
        }
    }

    /// Key for callers on the local machine (CLI, tests)
    pub fn local() -> Self {
        ClientKey("local".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sliding-window request limiter.
///
/// Each client keeps the instants of its admitted requests inside the
/// current window; a request is admitted while fewer than `max_requests`
/// remain after expired instants are dropped.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: Mutex<HashMap<ClientKey, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// A limiter that admits everything
    pub fn unlimited() -> Self {
        Self {
            max_requests: usize::MAX,
            window: Duration::from_secs(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Charge one request to `client`. On refusal returns how long until
    /// the oldest request in the window expires.
    pub fn check(&self, client: &ClientKey) -> Result<(), Duration> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &ClientKey, now: Instant) -> Result<(), Duration> {
        if self.max_requests == usize::MAX {
            return Ok(());
        }

        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Forget clients whose windows have fully expired
        clients.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });

        let hits = clients.entry(client.clone()).or_default();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.max_requests {
            let retry_after = hits
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            debug!(client = %client, in_window = hits.len(), "Rate limit exceeded");
            return Err(retry_after);
        }

        hits.push_back(now);
        Ok(())
    }
}
