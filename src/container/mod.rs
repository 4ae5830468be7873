//! Container lifecycle (spec.md §4.D): Created → Running → (Exited |
//! Removed).
//!
//! Grounded in the teacher's `docker/service.rs` (method shapes and the
//! 404/409 daemon-error matching idiom) and `environment/docker/power.rs`
//! (cancellation-aware start/wait/terminate via `tokio::select!`).

pub mod config;
mod logs;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::{ContainerConfig, HealthCheckConfig, NetworkConfig, PortBinding};

use crate::client::SocketClient;
use crate::error::{EngineError, Result};
use crate::log_writer::LogWriter;
use crate::stream::{CloseWrapper, Stream};
use crate::tar_util;
use crate::urlenc::encode_query_value;

/// A handle to one daemon container. Cheap to clone: the daemon id lives
/// behind an `Arc<Mutex<Option<String>>>` so every clone observes the id
/// assigned by `create()`.
#[derive(Clone)]
pub struct Container {
    client: SocketClient,
    config: ContainerConfig,
    id: Arc<Mutex<Option<String>>>,
    /// The proxy env pairs `create()` resolved into the wire body, kept so
    /// `commit()` can resend the exact same config (spec.md §4.D `Commit`).
    created_proxy_env: Arc<Mutex<Vec<(String, String)>>>,
    exit: CancellationToken,
    tick: Duration,
}

impl Container {
    pub(crate) fn new(
        client: SocketClient,
        config: ContainerConfig,
        exit: CancellationToken,
        tick: Duration,
    ) -> Self {
        Self {
            client,
            config,
            id: Arc::new(Mutex::new(None)),
            created_proxy_env: Arc::new(Mutex::new(Vec::new())),
            exit,
            tick,
        }
    }

    pub(crate) fn from_existing(
        client: SocketClient,
        id: String,
        config: ContainerConfig,
        exit: CancellationToken,
        tick: Duration,
    ) -> Self {
        Self {
            client,
            config,
            id: Arc::new(Mutex::new(Some(id))),
            created_proxy_env: Arc::new(Mutex::new(Vec::new())),
            exit,
            tick,
        }
    }

    pub fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    fn require_id(&self) -> Result<String> {
        self.id
            .lock()
            .clone()
            .ok_or_else(|| EngineError::Other("container has no id (call create() first)".into()))
    }

    /// The engine exit signal this container observes.
    pub fn exit_signal(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// This container's tick interval for health/restart polling.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Build the daemon container and record the assigned id.
    ///
    /// `proxy_env` is every `(lower, value)`/`(UPPER, value)` pair the
    /// engine decided to inject (spec.md §4.D: only when the container
    /// doesn't request `SkipProxy` and the daemon is the default local
    /// socket, or the engine is configured to proxy remotely).
    pub async fn create(&self, proxy_env: &[(String, String)]) -> Result<()> {
        let proxy_env: &[(String, String)] = if self.config.skip_proxy { &[] } else { proxy_env };
        *self.created_proxy_env.lock() = proxy_env.to_vec();
        let body = self.config.to_wire_body(proxy_env);
        let path = format!("/containers/create?name={}", encode_query_value(&self.config.name));

        #[derive(Deserialize)]
        struct CreateResponse {
            #[serde(rename = "Id")]
            id: String,
        }
        let resp: Option<CreateResponse> = self
            .client
            .post(&path, Some(&body), Some(self.exit.clone()))
            .await?;
        let resp = resp.ok_or_else(|| EngineError::Protocol("create returned no body".into()))?;
        *self.id.lock() = Some(resp.id);
        info!(id = %self.id().unwrap_or_default(), name = %self.config.name, "container created");
        Ok(())
    }

    /// Start the container without waiting for it to exit.
    pub async fn background(&self) -> Result<()> {
        let id = self.require_id()?;
        let path = format!("/containers/{}/start", id);
        let _: Option<serde_json::Value> =
            self.client.post::<(), _>(&path, None, Some(self.exit.clone())).await?;
        Ok(())
    }

    /// Start the container, pumping its combined stdout/stderr into `out`
    /// with each line prefixed by `prefix`, and block until it exits (or
    /// the engine's exit signal fires, which maps to
    /// [`crate::error::CANCELLED_EXIT_STATUS`]).
    ///
    /// If `restart` is set, once the first wait completes a background task
    /// periodically restarts the container (POST `.../restart`) and
    /// reattaches logs from the new `State.StartedAt` minus 100ms so the
    /// combined log is continuous across restarts; it keeps going, logging
    /// failures, until the engine is closed. The first observed exit status
    /// is still what's returned to the caller (spec.md §4.D `Start`).
    pub async fn start(
        &self,
        out: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
        prefix: &str,
        restart: bool,
    ) -> Result<i64> {
        self.background().await?;

        let writer = Arc::new(LogWriter::new(out));
        let id = self.require_id()?;
        let prefix_owned = prefix.to_string();
        let _pump = logs::pump_logs(
            self.client.clone(),
            id.clone(),
            writer.clone(),
            Some(prefix_owned.clone()),
            self.exit.clone(),
        );

        let status = tokio::select! {
            biased;
            _ = self.exit.cancelled() => crate::error::CANCELLED_EXIT_STATUS,
            s = self.wait() => s?,
        };

        if restart {
            let me = self.clone();
            let me2 = self.clone();
            let tick = self.tick;
            let exit = self.exit.clone();
            let client = self.client.clone();
            tokio::spawn(async move {
                logs::restart_loop(
                    id,
                    tick,
                    exit,
                    move || {
                        let me = me.clone();
                        Box::pin(async move {
                            me.restart_container().await?;
                            me.wait().await?;
                            Ok(())
                        })
                    },
                    move || {
                        let me2 = me2.clone();
                        Box::pin(async move { me2.started_at_minus_100ms().await })
                    },
                    client,
                    writer,
                    Some(prefix_owned),
                )
                .await;
            });
        }

        Ok(status)
    }

    /// POST `/containers/<id>/restart?t=1` (1s grace, per spec.md §4.D).
    pub async fn restart_container(&self) -> Result<()> {
        let id = self.require_id()?;
        let path = format!("/containers/{}/restart?t=1", id);
        let _: Option<serde_json::Value> = self
            .client
            .post::<(), _>(&path, None, Some(self.exit.clone()))
            .await?;
        Ok(())
    }

    /// The container's `State.StartedAt`, minus 100ms, as RFC3339-nano —
    /// used as the `since` parameter when reattaching logs after a restart
    /// so the combined stream has no gap or overlap.
    async fn started_at_minus_100ms(&self) -> Result<String> {
        let id = self.require_id()?;
        let path = format!("/containers/{}/json", id);

        #[derive(Deserialize)]
        struct Inspect {
            #[serde(rename = "State")]
            state: InspectState,
        }
        #[derive(Deserialize)]
        struct InspectState {
            #[serde(rename = "StartedAt")]
            started_at: String,
        }

        let inspect: Inspect = self.client.get_cancellable(&path, Some(self.exit.clone())).await?;
        let started_at = chrono::DateTime::parse_from_rfc3339(&inspect.state.started_at)
            .map_err(|e| EngineError::Protocol(format!("bad StartedAt: {}", e)))?;
        let adjusted = started_at - chrono::Duration::milliseconds(100);
        Ok(adjusted.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
    }

    /// Block until the container exits, returning its exit status.
    /// [`crate::error::CANCELLED_EXIT_STATUS`] if the engine's exit signal
    /// fires first.
    pub async fn wait(&self) -> Result<i64> {
        let id = self.require_id()?;
        let path = format!("/containers/{}/wait", id);

        #[derive(Deserialize)]
        struct WaitResponse {
            #[serde(rename = "StatusCode")]
            status_code: i64,
        }

        tokio::select! {
            biased;
            _ = self.exit.cancelled() => Ok(crate::error::CANCELLED_EXIT_STATUS),
            r = self.client.post::<(), WaitResponse>(&path, None, None) => {
                let resp = r?.ok_or_else(|| EngineError::Protocol("wait returned no body".into()))?;
                Ok(resp.status_code)
            }
        }
    }

    /// Spawn a background task that inspects the container every tick and
    /// yields its health status string (`"none"` if no healthcheck is
    /// configured) until the engine's exit signal fires (spec.md §4.D
    /// `HealthCheck`). Successive duplicate samples are allowed; callers
    /// sample the channel, they don't dedupe it.
    pub fn health_check(&self) -> tokio::sync::mpsc::Receiver<String> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let client = self.client.clone();
        let id_holder = self.id.clone();
        let exit = self.exit.clone();
        let tick = self.tick;

        tokio::spawn(async move {
            #[derive(Deserialize)]
            struct Inspect {
                #[serde(rename = "State")]
                state: InspectState,
            }
            #[derive(Deserialize)]
            struct InspectState {
                #[serde(rename = "Health")]
                health: Option<InspectHealth>,
            }
            #[derive(Deserialize)]
            struct InspectHealth {
                #[serde(rename = "Status")]
                status: String,
            }

            loop {
                let id = match id_holder.lock().clone() {
                    Some(id) => id,
                    None => {
                        if tx.send("none".to_string()).await.is_err() {
                            return;
                        }
                        tokio::select! {
                            biased;
                            _ = exit.cancelled() => return,
                            _ = tokio::time::sleep(tick) => continue,
                        }
                    }
                };
                let path = format!("/containers/{}/json", id);
                let status = match client.get_cancellable::<Inspect>(&path, Some(exit.clone())).await {
                    Ok(inspect) => inspect
                        .state
                        .health
                        .map(|h| h.status)
                        .unwrap_or_else(|| "none".to_string()),
                    Err(_) => "none".to_string(),
                };
                if tx.send(status).await.is_err() {
                    return;
                }
                tokio::select! {
                    biased;
                    _ = exit.cancelled() => return,
                    _ = tokio::time::sleep(tick) => {}
                }
            }
        });

        rx
    }

    /// Open an interactive shell: create and start an `exec` against `cmd`
    /// with a TTY, returning the hijacked duplex connection plus a resize
    /// handle. Raw-mode and window-resize *detection* are the TTY
    /// collaborator's job (spec.md §1 Non-goals); issuing the resize POST
    /// once the collaborator detects a resize is this engine's (spec.md
    /// §4.D `Shell`).
    pub async fn shell(&self, cmd: Vec<String>) -> Result<(hyper::upgrade::Upgraded, ExecResizeHandle)> {
        let id = self.require_id()?;

        #[derive(serde::Serialize)]
        struct ExecCreateBody {
            #[serde(rename = "Cmd")]
            cmd: Vec<String>,
            #[serde(rename = "AttachStdin")]
            attach_stdin: bool,
            #[serde(rename = "AttachStdout")]
            attach_stdout: bool,
            #[serde(rename = "AttachStderr")]
            attach_stderr: bool,
            #[serde(rename = "Tty")]
            tty: bool,
        }
        #[derive(Deserialize)]
        struct ExecCreateResponse {
            #[serde(rename = "Id")]
            id: String,
        }

        let create_path = format!("/containers/{}/exec", id);
        let body = ExecCreateBody {
            cmd: if cmd.is_empty() { vec!["/bin/sh".into()] } else { cmd },
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty: true,
        };
        let resp: Option<ExecCreateResponse> = self
            .client
            .post(&create_path, Some(&body), Some(self.exit.clone()))
            .await?;
        let resp = resp.ok_or_else(|| EngineError::Protocol("exec create returned no body".into()))?;

        let start_path = format!("/exec/{}/start", resp.id);
        let conn = self.client.hijack(hyper::Method::POST, &start_path).await?;
        let handle = ExecResizeHandle {
            client: self.client.clone(),
            exec_id: resp.id,
            exit: self.exit.clone(),
        };
        Ok((conn, handle))
    }

    /// Run `cmd` to completion without a TTY (e.g. the `chown` a volume
    /// upload issues after writing files), returning its exit code.
    pub async fn exec(&self, cmd: Vec<String>) -> Result<i64> {
        let id = self.require_id()?;

        #[derive(serde::Serialize)]
        struct ExecCreateBody {
            #[serde(rename = "Cmd")]
            cmd: Vec<String>,
            #[serde(rename = "AttachStdout")]
            attach_stdout: bool,
            #[serde(rename = "AttachStderr")]
            attach_stderr: bool,
        }
        #[derive(serde::Serialize)]
        struct ExecStartBody {
            #[serde(rename = "Detach")]
            detach: bool,
            #[serde(rename = "Tty")]
            tty: bool,
        }
        #[derive(Deserialize)]
        struct ExecCreateResponse {
            #[serde(rename = "Id")]
            id: String,
        }
        #[derive(Deserialize)]
        struct ExecInspect {
            #[serde(rename = "Running")]
            running: bool,
            #[serde(rename = "ExitCode")]
            exit_code: Option<i64>,
        }

        let create_path = format!("/containers/{}/exec", id);
        let body = ExecCreateBody { cmd, attach_stdout: true, attach_stderr: true };
        let resp: Option<ExecCreateResponse> = self
            .client
            .post(&create_path, Some(&body), Some(self.exit.clone()))
            .await?;
        let resp = resp.ok_or_else(|| EngineError::Protocol("exec create returned no body".into()))?;

        let start_path = format!("/exec/{}/start", resp.id);
        let start_body = ExecStartBody { detach: false, tty: false };
        let _: Option<serde_json::Value> = self
            .client
            .post(&start_path, Some(&start_body), Some(self.exit.clone()))
            .await?;

        let inspect_path = format!("/exec/{}/json", resp.id);
        loop {
            let inspect: ExecInspect = self
                .client
                .get_cancellable(&inspect_path, Some(self.exit.clone()))
                .await?;
            if !inspect.running {
                return Ok(inspect.exit_code.unwrap_or(0));
            }
            tokio::select! {
                biased;
                _ = self.exit.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
    }

    /// Commit the container's current filesystem as a new image, returning
    /// the new image id.
    pub async fn commit(&self, repo: &str, tag: &str) -> Result<String> {
        let id = self.require_id()?;
        let path = format!(
            "/commit?container={}&repo={}&tag={}&pause=true",
            encode_query_value(&id),
            encode_query_value(repo),
            encode_query_value(tag)
        );
        let proxy_env = self.created_proxy_env.lock().clone();
        let body = self.config.to_wire_body(&proxy_env);

        #[derive(Deserialize)]
        struct CommitResponse {
            #[serde(rename = "Id")]
            id: String,
        }
        let resp: Option<CommitResponse> = self
            .client
            .post(&path, Some(&body), Some(self.exit.clone()))
            .await?;
        let resp = resp.ok_or_else(|| EngineError::Protocol("commit returned no body".into()))?;
        Ok(resp.id)
    }

    /// Upload a pre-built tar archive at `dest_dir` (spec.md §4.D
    /// `UploadTarTo`).
    pub async fn upload_tar_to(&self, dest_dir: &str, tar_bytes: Vec<u8>) -> Result<()> {
        let id = self.require_id()?;
        let path = format!(
            "/containers/{}/archive?path={}",
            id,
            encode_query_value(dest_dir)
        );
        self.client
            .put_raw(&path, Bytes::from(tar_bytes), Some(self.exit.clone()))
            .await
    }

    /// Stream an arbitrary tar body at `dest_dir` without buffering it
    /// fully first (spec.md §4.D `StreamTarTo`).
    pub async fn stream_tar_to(&self, dest_dir: &str, mut tar: Stream) -> Result<()> {
        let mut buf = Vec::with_capacity(tar.size() as usize);
        tar.out(&mut buf).await?;
        self.upload_tar_to(dest_dir, buf).await
    }

    /// Write a single file's contents into the container at `dest_path`,
    /// wrapping `reader` in a one-entry tar (mode 0755) first (spec.md §4.D
    /// `StreamFileTo`).
    pub async fn stream_file_to(
        &self,
        dest_path: &str,
        reader: impl AsyncRead + Unpin,
        size: u64,
    ) -> Result<()> {
        self.stream_file_to_with_mode(dest_path, reader, size, 0o755).await
    }

    /// As [`Self::stream_file_to`], but with an explicit tar entry mode —
    /// used internally where the uploaded file isn't meant to be executed
    /// (buildpack zips, the forwarder's ssh-code file).
    pub(crate) async fn stream_file_to_with_mode(
        &self,
        dest_path: &str,
        mut reader: impl AsyncRead + Unpin,
        size: u64,
        mode: u32,
    ) -> Result<()> {
        let path = Path::new(dest_path);
        let name = path
            .file_name()
            .ok_or_else(|| EngineError::Other(format!("invalid destination path: {}", dest_path)))?
            .to_string_lossy()
            .to_string();
        let dir = dirname(dest_path);

        let mut body = Vec::with_capacity(size as usize);
        let mut limited = (&mut reader).take(size);
        limited.read_to_end(&mut body).await?;
        if (body.len() as u64) < size {
            return Err(EngineError::Tar("EOF".into()));
        }

        let tar_bytes = tokio::task::spawn_blocking(move || {
            tar_util::tar_file(&name, std::io::Cursor::new(body), size, mode)
        })
        .await
        .map_err(|e| EngineError::Other(e.to_string()))??;

        self.upload_tar_to(&dir, tar_bytes).await
    }

    /// Fetch a single file out of the container (spec.md §4.D
    /// `StreamFileFrom`).
    pub async fn stream_file_from(&self, path: &str) -> Result<Stream> {
        let id = self.require_id()?;
        let name = Path::new(path)
            .file_name()
            .ok_or_else(|| EngineError::Other(format!("invalid source path: {}", path)))?
            .to_string_lossy()
            .to_string();

        let req_path = format!("/containers/{}/archive?path={}", id, encode_query_value(path));
        let resp = self
            .client
            .do_request(hyper::Method::GET, &req_path, None, Some(self.exit.clone()))
            .await?;
        if resp.status >= 400 {
            let mut body = resp.body;
            let mut bytes = Vec::new();
            body.read_to_end(&mut bytes).await?;
            return Err(EngineError::from_daemon_message(
                resp.status,
                String::from_utf8_lossy(&bytes).to_string(),
            ));
        }

        let mut body = resp.body;
        let mut archive = Vec::new();
        body.read_to_end(&mut archive).await?;

        let (header, file_bytes) = tokio::task::spawn_blocking(move || {
            tar_util::file_from_tar(&name, std::io::Cursor::new(archive))
        })
        .await
        .map_err(|e| EngineError::Other(e.to_string()))??;

        Ok(Stream::with_null_closer(std::io::Cursor::new(file_bytes), header.size))
    }

    /// Fetch a directory subtree out of the container as a raw tar stream
    /// (spec.md §4.D `StreamTarFrom`). The returned stream's close hook
    /// releases the underlying HTTP body; it does not close the container.
    pub async fn stream_tar_from(&self, path: &str) -> Result<Stream> {
        let id = self.require_id()?;
        let dir_path = format!("{}/.", path.trim_end_matches('/'));
        let req_path = format!("/containers/{}/archive?path={}", id, encode_query_value(&dir_path));
        let resp = self
            .client
            .do_request(hyper::Method::GET, &req_path, None, Some(self.exit.clone()))
            .await?;
        if resp.status >= 400 {
            let mut body = resp.body;
            let mut bytes = Vec::new();
            body.read_to_end(&mut bytes).await?;
            return Err(EngineError::from_daemon_message(
                resp.status,
                String::from_utf8_lossy(&bytes).to_string(),
            ));
        }
        let size = if resp.content_length >= 0 { resp.content_length as u64 } else { 0 };
        Ok(Stream::with_null_closer(resp.body, size))
    }

    /// Create an empty directory inside the container by uploading a
    /// directory-only tar entry, mode 0755 (spec.md §4.D `Mkdir`).
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let id = self.require_id()?;
        let name = Path::new(path)
            .file_name()
            .ok_or_else(|| EngineError::Other(format!("invalid directory path: {}", path)))?
            .to_string_lossy()
            .to_string();
        let parent = dirname(path);

        let tar_bytes = tokio::task::spawn_blocking(move || {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_path(&name).map_err(|e| EngineError::Tar(e.to_string()))?;
            header.set_size(0);
            header.set_mode(0o755);
            header.set_entry_type(tar::EntryType::Directory);
            header.set_cksum();
            builder
                .append(&header, std::io::empty())
                .map_err(|e| EngineError::Tar(e.to_string()))?;
            builder.into_inner().map_err(|e| EngineError::Tar(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Other(e.to_string()))??;

        let upload_path = format!("/containers/{}/archive?path={}", id, encode_query_value(&parent));
        self.client
            .put_raw(&upload_path, Bytes::from(tar_bytes), Some(self.exit.clone()))
            .await
    }

    /// Stop (if running) and remove the container. Does not forget the id:
    /// a repeat call re-issues the same `ContainerRemove` and surfaces
    /// whatever the daemon says, including "No such container" — the id
    /// is only ever assigned once, by `create()`.
    pub async fn close(&self) -> Result<()> {
        let id = self.require_id()?;
        let path = format!("/containers/{}?force=1&v=1", id);
        self.client
            .delete::<serde_json::Value>(&path, Some(self.exit.clone()))
            .await?;
        Ok(())
    }

    /// Splice a "close this container too" hook onto `stream`'s existing
    /// close chain (spec.md §4.D `CloseAfterStream`), so the caller's
    /// eventual `stream.close()` also tears down the container that
    /// produced it.
    pub fn close_after_stream(&self, stream: Stream) -> Stream {
        let me = self.clone();
        let (reader, size, closer) = stream.into_parts();
        let wrapped = CloseWrapper::new(closer, move || {
            let me = me.clone();
            async move { me.close().await }
        });
        Stream::new(ReaderAdapter(reader), size, wrapped)
    }
}

/// Drives `/exec/<id>/resize?h=&w=` on behalf of a TTY collaborator that
/// detected a window-resize signal (spec.md §4.D `Shell`).
#[derive(Clone)]
pub struct ExecResizeHandle {
    client: SocketClient,
    exec_id: String,
    exit: CancellationToken,
}

impl ExecResizeHandle {
    pub async fn resize(&self, height: u16, width: u16) -> Result<()> {
        let path = format!("/exec/{}/resize?h={}&w={}", self.exec_id, height, width);
        let _: Option<serde_json::Value> = self
            .client
            .post::<(), _>(&path, None, Some(self.exit.clone()))
            .await?;
        Ok(())
    }
}

/// `Stream::new` wants an owned `impl AsyncRead`, but `into_parts` hands
/// back a boxed trait object; this newtype bridges the two without an
/// extra copy.
struct ReaderAdapter(std::pin::Pin<Box<dyn AsyncRead + Send>>);

impl AsyncRead for ReaderAdapter {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.0.as_mut().poll_read(cx, buf)
    }
}

fn dirname(path: &str) -> String {
    match Path::new(path).parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().to_string(),
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirname_of_nested_path() {
        assert_eq!(dirname("/app/bin/run.sh"), "/app/bin");
    }

    #[test]
    fn dirname_of_top_level_path() {
        assert_eq!(dirname("run.sh"), "/");
    }

    #[tokio::test]
    async fn require_id_fails_before_create() {
        let client = SocketClient::new("/var/run/docker.sock");
        let container = Container::new(
            client,
            ContainerConfig::new("test", "busybox"),
            CancellationToken::new(),
            Duration::from_millis(10),
        );
        assert!(container.require_id().is_err());
    }
}
