//! Root factory binding a daemon connection, proxy config, and exit signal
//! (spec.md §4.G).
//!
//! Generalizes the teacher's `DockerEnvironment::new` (which owns a single
//! `Docker` client per server) into a shared handle every `Container` /
//! `Image` / `Volume` is constructed from — the cyclic
//! engine-owns-children/children-reference-engine shape spec.md §9 calls
//! out becomes a one-way `Arc`-free handle passed in at construction, not a
//! back-pointer.

use tokio_util::sync::CancellationToken;

use crate::client::SocketClient;
use crate::config::EngineConfig;
use crate::container::{Container, ContainerConfig};
use crate::image::Image;
use crate::volume::Volume;

/// Process-local handle owning one daemon connection, a proxy-env
/// configuration, and a process-wide "exit" signal (spec.md §3).
///
/// Created by the host, closed exactly once. Closing does not race with
/// outstanding container operations: every background task holds a clone
/// of the same [`CancellationToken`] and observes it at its own
/// suspension points.
#[derive(Clone)]
pub struct Engine {
    client: SocketClient,
    config: EngineConfig,
    exit: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let client = SocketClient::new(&config.socket_path);
        Self {
            client,
            config,
            exit: CancellationToken::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// `(key, value)` pairs to inject into a container's env at create time
    /// (spec.md §4.D): both the lower- and upper-case form of each
    /// configured proxy variable, but only when the daemon is the
    /// conventional local socket or remote proxying was explicitly
    /// requested.
    pub fn proxy_env_pairs(&self) -> Vec<(String, String)> {
        if !(self.config.is_default_local_socket() || self.config.use_proxy_remotely) {
            return Vec::new();
        }
        let mut out = Vec::new();
        for (lower, upper, value) in self.config.proxy.pairs() {
            out.push((lower.to_string(), value.to_string()));
            out.push((upper.to_string(), value.to_string()));
        }
        out
    }

    pub fn client(&self) -> &SocketClient {
        &self.client
    }

    /// The broadcast exit signal observed by every background task.
    pub fn exit_signal(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// Request a clean shutdown. Idempotent; the socket client itself has
    /// nothing to close (dials are per-request), so this only flips the
    /// exit signal that running operations select on.
    pub fn close(&self) {
        self.exit.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.exit.is_cancelled()
    }

    /// Build a `Container` bound to this engine's client, exit signal, and
    /// default tick, from the given create-config.
    pub fn container(&self, config: ContainerConfig) -> Container {
        Container::new(
            self.client.clone(),
            config,
            self.exit_signal(),
            self.config.tick,
        )
    }

    /// Bind to an already-existing container by daemon ID (e.g. for
    /// `Shell`/`Commit` on a container this process didn't create).
    pub fn existing_container(&self, id: String, config: ContainerConfig) -> Container {
        Container::from_existing(
            self.client.clone(),
            id,
            config,
            self.exit_signal(),
            self.config.tick,
        )
    }

    pub fn image(&self, reference: impl Into<String>) -> Image {
        Image::new(self.client.clone(), reference.into(), self.exit_signal())
    }

    pub fn volume(
        &self,
        name: impl Into<String>,
        mount_path: impl Into<String>,
        helper_image: impl Into<String>,
    ) -> Volume {
        Volume::new(
            self.client.clone(),
            name.into(),
            mount_path.into(),
            helper_image.into(),
            self.exit_signal(),
            self.config.tick,
        )
    }
}
