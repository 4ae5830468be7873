//! Stager (spec.md §4.H): runs the buildpack detect/build phase inside a
//! transient container, yielding a droplet stream and an updated cache.
//!
//! Grounded in the teacher's `docker/service.rs` container-lifecycle calls
//! composed together; the buildpack-specific upload/Cmd shape has no
//! teacher analogue and is modeled directly on spec.md §4.H.

use std::collections::HashMap;

use tracing::info;

use crate::app_config::AppConfig;
use crate::container::ContainerConfig;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::stream::Stream;
use crate::tar_util;

/// One buildpack's zip bytes, keyed by its fingerprint (spec.md §4.C
/// `fingerprint`).
pub type BuildpackSet = HashMap<String, Vec<u8>>;

pub struct StagerInput {
    pub app_tar: Vec<u8>,
    /// Previous cache tar; empty means no cache yet.
    pub cache: Vec<u8>,
    pub buildpacks: BuildpackSet,
    pub stack_image: String,
    pub app_config: AppConfig,
    pub force_detect: bool,
    /// Defaults to `/tmp/droplet` (spec.md §4.H step 8).
    pub output_path: Option<String>,
}

pub struct StagerOutput {
    pub droplet: Stream,
    pub cache: Vec<u8>,
}

/// Command-line args passed to the buildpack lifecycle binary (spec.md
/// §4.H step 1, verified against scenario 4 in spec.md §8).
pub fn lifecycle_args(app_config: &AppConfig, force_detect: bool) -> Vec<String> {
    let skip_detect = !(app_config.buildpacks.is_empty() || force_detect);
    let buildpack_order = if skip_detect { app_config.buildpacks.join(",") } else { String::new() };
    vec![format!("-skipDetect={}", skip_detect), "-buildpackOrder".to_string(), buildpack_order]
}

/// Run the full stage pipeline against a fresh `<name>-staging` container.
pub async fn stage(engine: &Engine, input: StagerInput) -> Result<StagerOutput> {
    let StagerInput {
        app_tar,
        cache,
        buildpacks,
        stack_image,
        app_config,
        force_detect,
        output_path,
    } = input;

    let cache_empty = cache.is_empty();
    let output_path = output_path.unwrap_or_else(|| "/tmp/droplet".to_string());

    let mut env = app_config.staging_merged_env(&HashMap::new());
    env.insert("PACK_APP_NAME".to_string(), app_config.name.clone());
    if let Some(mem) = app_config.memory_mb {
        env.insert("PACK_APP_MEM".to_string(), mem.to_string());
    }
    if let Some(disk) = app_config.disk_mb {
        env.insert("PACK_APP_DISK".to_string(), disk.to_string());
    }
    env.insert("VCAP_SERVICES".to_string(), app_config.vcap_services_json()?);

    let mut config = ContainerConfig::new(format!("{}-staging", app_config.name), stack_image);
    config.working_dir = Some("/tmp/app".to_string());
    config.cmd = Some(lifecycle_args(&app_config, force_detect));
    config.env = env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();

    let container = engine.container(config);
    container.create(&engine.proxy_env_pairs()).await?;

    for (fingerprint, zip) in buildpacks {
        let dest = format!("/buildpacks/{}.zip", fingerprint);
        let name = format!("{}.zip", fingerprint);
        let size = zip.len() as u64;
        container
            .stream_file_to_with_mode(&dest, std::io::Cursor::new(zip), size, 0o644)
            .await
            .map_err(|e| EngineError::Other(format!("uploading buildpack {}: {}", name, e)))?;
    }

    container.upload_tar_to("/tmp/app", app_tar).await?;

    if !cache_empty {
        container.mkdir("/tmp/cache").await?;
        container.upload_tar_to("/tmp/cache", cache).await?;
    }

    info!(app = %app_config.name, "staging container starting");
    let sink = tokio::io::sink();
    let status = container.start(sink, "staging", false).await?;
    if status != 0 {
        let _ = container.close().await;
        return Err(EngineError::Workflow(status));
    }

    let mut updated_cache = Vec::new();
    let mut cache_stream = container.stream_file_from("/cache/cache.tgz").await?;
    cache_stream.out(&mut updated_cache).await?;

    let droplet = container.stream_file_from(&output_path).await?;
    let droplet = container.close_after_stream(droplet);

    Ok(StagerOutput { droplet, cache: updated_cache })
}

/// Build the app tar from a local path — a directory tree or a pre-zipped
/// app bundle, either accepted — applying the default CF "application
/// files" excludes (spec.md §4.C).
pub fn build_app_tar(app_path: &std::path::Path) -> Result<Vec<u8>> {
    tar_util::tar_app(app_path, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_args_with_explicit_buildpacks_skips_detect() {
        let mut config = AppConfig::default();
        config.buildpacks = vec!["bp1".into(), "bp2".into()];
        let args = lifecycle_args(&config, false);
        assert_eq!(args, vec!["-skipDetect=true", "-buildpackOrder", "bp1,bp2"]);
    }

    #[test]
    fn lifecycle_args_with_no_buildpacks_runs_detect() {
        let config = AppConfig::default();
        let args = lifecycle_args(&config, false);
        assert_eq!(args, vec!["-skipDetect=false", "-buildpackOrder", ""]);
    }

    #[test]
    fn force_detect_overrides_explicit_buildpacks() {
        let mut config = AppConfig::default();
        config.buildpacks = vec!["bp1".into()];
        let args = lifecycle_args(&config, true);
        assert_eq!(args[0], "-skipDetect=false");
    }
}
