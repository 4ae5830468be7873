//! Container create-config (spec.md §3, §4.D) — immutable after create,
//! required later for `Commit` and `Shell`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

/// A host:container port binding (spec.md §4.D).
#[derive(Debug, Clone)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

/// `Test` + interval/timeout/start-period/retries, all durations as
/// nanoseconds on the wire per spec.md §4.D.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub start_period: Duration,
    pub retries: u32,
}

/// Either a host-port bind or joining an existing "network" container's
/// namespace (spec.md §3 `NetworkConfig`) — mutually exclusive,
/// `container_id` wins.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
    pub container_id: Option<String>,
}

impl NetworkConfig {
    pub fn bind(host_ip: impl Into<String>, host_port: u16) -> Self {
        Self {
            host_ip: Some(host_ip.into()),
            host_port: Some(host_port),
            container_id: None,
        }
    }

    pub fn join(container_id: impl Into<String>) -> Self {
        Self {
            host_ip: None,
            host_port: None,
            container_id: Some(container_id.into()),
        }
    }

    /// Docker's `network_mode` string when joining another container.
    pub fn network_mode(&self) -> Option<String> {
        self.container_id.as_ref().map(|id| format!("container:{}", id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub image: String,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub memory_bytes: Option<i64>,
    pub disk_quota_bytes: Option<i64>,
    pub binds: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub port_bindings: HashMap<String, Vec<PortBinding>>,
    pub healthcheck: Option<HealthCheckConfig>,
    pub network: NetworkConfig,
    /// If true, no proxy env is injected regardless of engine config.
    pub skip_proxy: bool,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Wire up `network` (spec.md §4.D `Create`: "Port-publish via
    /// NetworkConfig, or join a network container"). A host-port bind
    /// publishes `container_port` (e.g. `"8080/tcp"`); joining another
    /// container's namespace only sets `NetworkMode` on the wire body.
    pub fn with_network(mut self, network: NetworkConfig, container_port: &str) -> Self {
        if let Some(host_port) = network.host_port {
            self.exposed_ports = vec![container_port.to_string()];
            let mut bindings = HashMap::new();
            bindings.insert(
                container_port.to_string(),
                vec![PortBinding { host_ip: network.host_ip.clone(), host_port: Some(host_port) }],
            );
            self.port_bindings = bindings;
        }
        self.network = network;
        self
    }

    pub(crate) fn to_wire_body(&self, proxy_env: &[(String, String)]) -> CreateContainerBody {
        let mut env: Vec<String> = proxy_env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.extend(self.env.iter().cloned());

        let exposed_ports = if self.exposed_ports.is_empty() {
            None
        } else {
            Some(
                self.exposed_ports
                    .iter()
                    .map(|p| (p.clone(), serde_json::json!({})))
                    .collect(),
            )
        };

        let port_bindings = if self.port_bindings.is_empty() {
            None
        } else {
            Some(
                self.port_bindings
                    .iter()
                    .map(|(k, bindings)| {
                        let wire: Vec<WireBinding> = bindings
                            .iter()
                            .map(|b| WireBinding {
                                host_ip: b.host_ip.clone(),
                                host_port: b.host_port.map(|p| p.to_string()),
                            })
                            .collect();
                        (k.clone(), wire)
                    })
                    .collect(),
            )
        };

        CreateContainerBody {
            hostname: self.hostname.clone(),
            user: self.user.clone(),
            image: self.image.clone(),
            working_dir: self.working_dir.clone(),
            env: if env.is_empty() { None } else { Some(env) },
            entrypoint: self.entrypoint.clone(),
            cmd: self.cmd.clone(),
            exposed_ports,
            healthcheck: self.healthcheck.as_ref().map(WireHealthCheck::from),
            host_config: WireHostConfig {
                memory: self.memory_bytes,
                disk_quota: self.disk_quota_bytes,
                binds: if self.binds.is_empty() { None } else { Some(self.binds.clone()) },
                port_bindings,
                network_mode: self.network.network_mode(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateContainerBody {
    #[serde(rename = "Hostname", skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    cmd: Option<Vec<String>>,
    #[serde(rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
    #[serde(rename = "Healthcheck", skip_serializing_if = "Option::is_none")]
    healthcheck: Option<WireHealthCheck>,
    #[serde(rename = "HostConfig")]
    host_config: WireHostConfig,
}

#[derive(Debug, Serialize)]
struct WireBinding {
    #[serde(rename = "HostIp", skip_serializing_if = "Option::is_none")]
    host_ip: Option<String>,
    #[serde(rename = "HostPort", skip_serializing_if = "Option::is_none")]
    host_port: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireHealthCheck {
    #[serde(rename = "Test")]
    test: Vec<String>,
    #[serde(rename = "Interval")]
    interval: i64,
    #[serde(rename = "Timeout")]
    timeout: i64,
    #[serde(rename = "StartPeriod")]
    start_period: i64,
    #[serde(rename = "Retries")]
    retries: u32,
}

impl From<&HealthCheckConfig> for WireHealthCheck {
    fn from(h: &HealthCheckConfig) -> Self {
        Self {
            test: h.test.clone(),
            interval: h.interval.as_nanos() as i64,
            timeout: h.timeout.as_nanos() as i64,
            start_period: h.start_period.as_nanos() as i64,
            retries: h.retries,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireHostConfig {
    #[serde(rename = "Memory", skip_serializing_if = "Option::is_none")]
    memory: Option<i64>,
    #[serde(rename = "DiskQuota", skip_serializing_if = "Option::is_none")]
    disk_quota: Option<i64>,
    #[serde(rename = "Binds", skip_serializing_if = "Option::is_none")]
    binds: Option<Vec<String>>,
    #[serde(rename = "PortBindings", skip_serializing_if = "Option::is_none")]
    port_bindings: Option<HashMap<String, Vec<WireBinding>>>,
    #[serde(rename = "NetworkMode", skip_serializing_if = "Option::is_none")]
    network_mode: Option<String>,
}
