//! Forwarder (spec.md §4.J): a pair of networked containers tunnelling
//! service credentials to the app over SSH.
//!
//! Grounded in the teacher's container-create/start calls for the
//! lifecycle shape; the sshpass/ssh entrypoint rendering and retry loop
//! have no teacher analogue and are modeled directly on spec.md §4.J and
//! the Forwarder-retry scenario in spec.md §8.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::app_config::ForwardDetails;
use crate::container::{Container, ContainerConfig, HealthCheckConfig, NetworkConfig};
use crate::engine::Engine;
use crate::error::Result;
use crate::log_writer::LogWriter;

/// Render the service container's entrypoint: an `sshpass`+`ssh` command
/// embedding every configured port-forward as a `-L` flag.
pub fn render_service_script(details: &ForwardDetails) -> String {
    let forwards: String = details
        .forwards
        .iter()
        .map(|f| format!("-L {}:localhost:{} ", f.from, f.to))
        .collect();
    format!(
        "sshpass -f /tmp/ssh-code ssh -o StrictHostKeyChecking=no {forwards}-p {port} {user}@{host} -N",
        forwards = forwards,
        port = details.port,
        user = details.user,
        host = details.host,
    )
}

pub struct Forwarder {
    network: Container,
    service: Container,
    log_writer: Arc<LogWriter>,
}

impl Forwarder {
    /// Bring up the network + service container pair and start the retry
    /// loop that refreshes the one-time code on each `wait_tick`.
    pub async fn start(
        engine: &Engine,
        stack_image: String,
        host_ip: String,
        host_port: u16,
        mut details: ForwardDetails,
        log_sink: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
    ) -> Result<Self> {
        let mut network_config = ContainerConfig::new("network", stack_image.clone())
            .with_network(NetworkConfig::bind(host_ip, host_port), "8080/tcp");
        network_config.entrypoint = Some(vec!["tail".into(), "-f".into(), "/dev/null".into()]);

        let network = engine.container(network_config);
        network.create(&engine.proxy_env_pairs()).await?;
        network.background().await?;

        let script = render_service_script(&details);
        let mut service_config = ContainerConfig::new("service", stack_image);
        service_config.entrypoint = Some(vec!["/bin/bash".into(), "-c".into(), script]);
        service_config.network = NetworkConfig::join(network.id().unwrap_or_default());
        service_config.healthcheck = Some(HealthCheckConfig {
            test: vec!["CMD".into(), "test".into(), "-f".into(), "/tmp/healthy".into()],
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            start_period: Duration::from_secs(0),
            retries: 30,
        });

        let service = engine.container(service_config);
        service.create(&engine.proxy_env_pairs()).await?;

        let code = (details.code)()?;
        write_ssh_code(&service, code).await?;

        let log_writer = Arc::new(LogWriter::new(log_sink));
        let forwarder = Self { network, service, log_writer };
        forwarder.spawn_retry_loop(details)?;
        Ok(forwarder)
    }

    fn spawn_retry_loop(&self, mut details: ForwardDetails) -> Result<()> {
        let service = self.service.clone();
        let writer = self.log_writer.clone();
        let exit = service.exit_signal();
        let tick = service.tick();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = exit.cancelled() => return,
                    _ = tokio::time::sleep(tick) => {}
                }
                if writer.is_disabled() {
                    return;
                }
                let code = match (details.code)() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "forwarder: failed to fetch one-time code");
                        continue;
                    }
                };
                if let Err(e) = write_ssh_code(&service, code).await {
                    warn!(error = %e, "forwarder: failed to write ssh code");
                    continue;
                }
                match service.start(tokio::io::sink(), "service", false).await {
                    Ok(status) if status != 0 => {
                        warn!(status, "forwarder: service container exited non-zero");
                    }
                    Err(e) => warn!(error = %e, "forwarder: service container start failed"),
                    _ => {}
                }
            }
        });
        Ok(())
    }

    /// A channel of the service container's health status samples (spec.md
    /// §4.D `HealthCheck`, surfaced here per §4.J).
    pub fn health_status(&self) -> tokio::sync::mpsc::Receiver<String> {
        self.service.health_check()
    }

    pub fn network_container_id(&self) -> Option<String> {
        self.network.id()
    }

    /// Close both containers and permanently silence the log writer.
    pub async fn done(&self) -> Result<()> {
        self.log_writer.disable();
        let service_result = self.service.close().await;
        let network_result = self.network.close().await;
        service_result.and(network_result)
    }
}

async fn write_ssh_code(service: &Container, code: String) -> Result<()> {
    let bytes = code.into_bytes();
    let size = bytes.len() as u64;
    service.stream_file_to_with_mode("/tmp/ssh-code", std::io::Cursor::new(bytes), size, 0o600).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::PortForward;

    #[test]
    fn renders_ssh_command_with_forwards() {
        let details = ForwardDetails {
            host: "example.com".into(),
            port: 2222,
            user: "vcap".into(),
            code: Box::new(|| Ok("code".into())),
            forwards: vec![PortForward { name: "db".into(), from: 5432, to: 5432 }],
        };
        let script = render_service_script(&details);
        assert!(script.contains("-L 5432:localhost:5432"));
        assert!(script.contains("vcap@example.com"));
        assert!(script.contains("-p 2222"));
    }
}
