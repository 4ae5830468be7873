//! Named volume lifecycle (spec.md §4.F): create-on-demand, `Upload` via a
//! throwaway helper container, `Export` as a tar stream, `Close`/Delete.
//!
//! Grounded in the teacher's `docker/service.rs` volume methods for
//! create/remove shape; `Upload`'s helper-container-plus-chown dance has no
//! teacher analogue (the teacher doesn't stage buildpacks), modeled
//! directly on spec.md §4.F's description of how CF stages a cache volume.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::SocketClient;
use crate::container::{Container, ContainerConfig};
use crate::error::Result;
use crate::stream::Stream;
use crate::urlenc::encode_query_value;

#[derive(Clone)]
pub struct Volume {
    client: SocketClient,
    name: String,
    mount_path: String,
    helper_image: String,
    exit: CancellationToken,
    tick: Duration,
}

#[derive(Serialize)]
struct CreateVolumeBody<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
}

#[derive(Deserialize)]
struct VolumeInfo {
    #[serde(rename = "Name")]
    #[allow(dead_code)]
    name: String,
}

impl Volume {
    pub(crate) fn new(
        client: SocketClient,
        name: String,
        mount_path: String,
        helper_image: String,
        exit: CancellationToken,
        tick: Duration,
    ) -> Self {
        Self { client, name, mount_path, helper_image, exit, tick }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the volume if it doesn't already exist (spec.md §4.F
    /// "NewVolume is lazy: the first operation that needs the volume to
    /// exist creates it").
    async fn ensure_exists(&self) -> Result<()> {
        let path = format!("/volumes/{}", encode_query_value(&self.name));
        match self.client.get_cancellable::<VolumeInfo>(&path, Some(self.exit.clone())).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                let body = CreateVolumeBody { name: &self.name };
                let _: Option<VolumeInfo> = self
                    .client
                    .post("/volumes/create", Some(&body), Some(self.exit.clone()))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn helper_config(&self) -> ContainerConfig {
        let mut config = ContainerConfig::new(
            format!("{}-helper-{}", self.name, uuid::Uuid::new_v4()),
            self.helper_image.clone(),
        );
        config.binds = vec![format!("{}:{}", self.name, self.mount_path)];
        config.entrypoint = Some(vec!["/bin/sh".into(), "-c".into(), "sleep 3600".into()]);
        config.skip_proxy = true;
        config
    }

    /// Upload `data` into the volume at `dest_path` (relative to the
    /// volume's mount point), using a short-lived helper container to do
    /// the write, then chowning the tree to `owner` (e.g. `"vcap:vcap"`).
    pub async fn upload(&self, dest_path: &str, tar_bytes: Vec<u8>, owner: &str) -> Result<()> {
        self.ensure_exists().await?;

        let helper = Container::new(self.client.clone(), self.helper_config(), self.exit.clone(), self.tick);
        helper.create(&[]).await?;
        helper.background().await?;

        let full_path = format!("{}/{}", self.mount_path.trim_end_matches('/'), dest_path.trim_start_matches('/'));
        let result = helper.upload_tar_to(&full_path, tar_bytes).await;
        let chown_result = if result.is_ok() {
            helper
                .exec(vec!["chown".into(), "-R".into(), owner.to_string(), self.mount_path.clone()])
                .await
                .and_then(|code| {
                    if code == 0 {
                        Ok(())
                    } else {
                        Err(crate::error::EngineError::Workflow(code))
                    }
                })
        } else {
            Ok(())
        };

        if let Err(e) = helper.close().await {
            warn!(volume = %self.name, error = %e, "helper container cleanup failed");
        }

        result?;
        chown_result
    }

    /// Export the whole volume as a tar stream, via the same helper
    /// container pattern, closing the helper once the stream is drained.
    pub async fn export(&self) -> Result<Stream> {
        self.ensure_exists().await?;

        let helper = Container::new(self.client.clone(), self.helper_config(), self.exit.clone(), self.tick);
        helper.create(&[]).await?;
        helper.background().await?;

        match helper.stream_tar_from(&self.mount_path).await {
            Ok(stream) => Ok(helper.close_after_stream(stream)),
            Err(e) => {
                let _ = helper.close().await;
                Err(e)
            }
        }
    }

    /// Remove the volume. Idempotent.
    pub async fn delete(&self) -> Result<()> {
        let path = format!("/volumes/{}?force=1", encode_query_value(&self.name));
        match self.client.delete::<serde_json::Value>(&path, Some(self.exit.clone())).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Alias for `delete`, named to match the symmetric
    /// create/close pairing the rest of the engine uses (spec.md §4.F
    /// `Close`).
    pub async fn close(&self) -> Result<()> {
        self.delete().await
    }
}
