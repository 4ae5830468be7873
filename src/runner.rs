//! Runner / Exporter (spec.md §4.I): launch a staged droplet, optionally
//! bind a local dev directory for hot-reload, or commit a container as an
//! image.
//!
//! Grounded in the teacher's `docker/service.rs` container-create/start
//! calls; the rsync-then-launch entrypoint script and the Runner/Exporter
//! split have no teacher analogue and are modeled directly on spec.md
//! §4.I.

use std::path::PathBuf;

use crate::app_config::{AppConfig, NetworkConfig};
use crate::container::{Container, ContainerConfig};
use crate::engine::Engine;
use crate::error::Result;
use crate::stream::Stream;

const DEFAULT_APP_ROOT: &str = "/home/vcap";

pub struct RunnerInput {
    pub droplet: Stream,
    pub stack_image: String,
    /// Local directory bind-mounted at `/tmp/local` for hot-reload.
    pub app_dir: Option<PathBuf>,
    pub restart: bool,
    pub shell: bool,
    pub app_config: AppConfig,
    pub network: NetworkConfig,
    pub skip_stack_pull: bool,
}

/// Render the entrypoint script: rsync the bind-mounted dev directory over
/// the droplet if present, then exec the launcher with `command` (spec.md
/// §4.I).
pub fn render_run_script(work_dir: &str, command: &str) -> String {
    format!(
        "if [ -d /tmp/local ]; then rsync -a /tmp/local/ {work_dir}/; fi; exec /packs/launcher {command}",
        work_dir = work_dir,
        command = command,
    )
}

fn base_container_config(
    app_config: &AppConfig,
    stack_image: &str,
    network: &NetworkConfig,
    command: &str,
) -> ContainerConfig {
    let script = render_run_script(DEFAULT_APP_ROOT, command);
    let mut config = ContainerConfig::new(format!("{}-app", app_config.name), stack_image.to_string())
        .with_network(network.clone(), "8080/tcp");
    config.entrypoint = Some(vec!["/bin/bash".to_string(), "-c".to_string(), script]);
    config
}

/// Launch a droplet. Returns the exit status (or 0 when `shell` was
/// requested, since the TTY collaborator owns the interactive session).
pub async fn run(engine: &Engine, input: RunnerInput) -> Result<i64> {
    let RunnerInput {
        mut droplet,
        stack_image,
        app_dir,
        restart,
        shell,
        app_config,
        network,
        skip_stack_pull,
    } = input;

    if !skip_stack_pull {
        let image = engine.image(stack_image.clone());
        image.pull(|_| {}).await?;
    }

    let command = app_config.command.clone().unwrap_or_default();
    let mut config = base_container_config(&app_config, &stack_image, &network, &command);
    if let Some(dir) = &app_dir {
        config.binds.push(format!("{}:/tmp/local", dir.to_string_lossy()));
    }
    if let Some(mb) = app_config.memory_mb {
        config.memory_bytes = Some(mb * 1024 * 1024);
    }
    if let Some(mb) = app_config.disk_mb {
        config.disk_quota_bytes = Some(mb * 1024 * 1024);
    }

    let container = engine.container(config);
    container.create(&engine.proxy_env_pairs()).await?;

    let mut body = Vec::with_capacity(droplet.size() as usize);
    droplet.out(&mut body).await?;
    container.upload_tar_to(DEFAULT_APP_ROOT, body).await?;

    if shell {
        container.background().await?;
        let (_conn, _resize) = container.shell(vec!["/packs/shell".to_string()]).await?;
        return Ok(0);
    }

    container.start(tokio::io::sink(), &app_config.name, restart).await
}

/// Commit a droplet + stack as a new image, without the resource limits a
/// running app would carry.
pub async fn export(
    engine: &Engine,
    mut droplet: Stream,
    stack_image: String,
    app_config: AppConfig,
    reference: &str,
) -> Result<String> {
    let command = app_config.command.clone().unwrap_or_default();
    let mut config = base_container_config(&app_config, &stack_image, &NetworkConfig::default(), &command);
    config.memory_bytes = None;
    config.disk_quota_bytes = None;

    let container: Container = engine.container(config);
    container.create(&engine.proxy_env_pairs()).await?;

    let mut body = Vec::with_capacity(droplet.size() as usize);
    droplet.out(&mut body).await?;
    container.upload_tar_to(DEFAULT_APP_ROOT, body).await?;

    let (repo, tag) = reference.rsplit_once(':').unwrap_or((reference, "latest"));
    let image_id = container.commit(repo, tag).await;
    let _ = container.close().await;
    image_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_script_rsyncs_when_local_dir_present() {
        let script = render_run_script("/home/vcap", "./run");
        assert!(script.contains("rsync -a /tmp/local/ /home/vcap/"));
        assert!(script.ends_with("exec /packs/launcher ./run"));
    }
}
