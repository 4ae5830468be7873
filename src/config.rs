//! Process-wide defaults and the engine's env-driven configuration.
//!
//! The CLI/manifest layer that would normally own a config file is an
//! external collaborator in this crate (spec.md §1); what's left here is
//! exactly the knobs the engine itself needs to dial the daemon.

use std::env;
use std::time::Duration;

/// Default Unix-domain socket the daemon listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Default cadence for health-check polling and restart-loop ticks.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the daemon's Unix-domain socket.
    pub socket_path: String,

    /// Proxy environment values to inject into container creates, unless
    /// `SkipProxy` is requested for that container (spec.md §4.D).
    pub proxy: ProxyConfig,

    /// Whether proxy injection applies even when the daemon host isn't the
    /// default local socket (spec.md §4.D: "or the engine is configured to
    /// use proxies remotely").
    pub use_proxy_remotely: bool,

    /// Health/restart tick interval.
    pub tick: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            socket_path: env::var("DOCKER_SOCKET")
                .unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string()),
            proxy: ProxyConfig::from_env(),
            use_proxy_remotely: env::var("FORGE_PROXY_REMOTE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            tick: env::var("FORGE_TICK_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TICK),
        }
    }

    /// True when the socket path is the conventional local Docker socket.
    pub fn is_default_local_socket(&self) -> bool {
        self.socket_path == DEFAULT_SOCKET_PATH
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            proxy: ProxyConfig::default(),
            use_proxy_remotely: false,
            tick: DEFAULT_TICK,
        }
    }
}

/// Proxy env-vars forwarded into created containers (spec.md §4.D).
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self {
            http_proxy: non_empty(env::var("http_proxy").or_else(|_| env::var("HTTP_PROXY")).ok()),
            https_proxy: non_empty(
                env::var("https_proxy")
                    .or_else(|_| env::var("HTTPS_PROXY"))
                    .ok(),
            ),
            no_proxy: non_empty(env::var("no_proxy").or_else(|_| env::var("NO_PROXY")).ok()),
        }
    }

    /// `(lower_key, UPPER_KEY, value)` triples for every non-empty value,
    /// in the order create() prepends them (spec.md §4.D).
    pub fn pairs(&self) -> Vec<(&'static str, &'static str, &str)> {
        let mut out = Vec::new();
        if let Some(v) = self.http_proxy.as_deref() {
            out.push(("http_proxy", "HTTP_PROXY", v));
        }
        if let Some(v) = self.https_proxy.as_deref() {
            out.push(("https_proxy", "HTTPS_PROXY", v));
        }
        if let Some(v) = self.no_proxy.as_deref() {
            out.push(("no_proxy", "NO_PROXY", v));
        }
        out
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}
