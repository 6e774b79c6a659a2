// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Transfer tasks: cancellable downloads with progress reports and cleanup
// of remote archives and local partial files on every exit path

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use ssh_gateway_common::{DownloadProgress, GatewayError, Result, ServerEvent, Target};

use crate::client::ClientSink;

use super::exec::{guarded_exec, RemoteCommand};
use super::remote::RemoteFs;
use super::{join_path, validate_name};

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

const CHUNK_SIZE: usize = 64 * 1024;
const PART_SUFFIX: &str = ".part";

/// One tracked download
pub struct TransferTask {
    pub id: String,
    cancel: CancellationToken,
    started: Instant,
    total: AtomicU64,
    transferred: AtomicU64,
    /// Set once packing starts; removed remotely on every outcome
    remote_archive: Mutex<Option<String>>,
}

impl TransferTask {
    fn new(id: String) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            total: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            remote_archive: Mutex::new(None),
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Throughput between consecutive samples
#[derive(Debug)]
pub struct ProgressMeter {
    last_at: Instant,
    last_bytes: u64,
}

impl ProgressMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            last_at: now,
            last_bytes: 0,
        }
    }

    pub fn sample(
        &mut self,
        task_id: &str,
        now: Instant,
        transferred: u64,
        total: u64,
    ) -> DownloadProgress {
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        let delta = transferred.saturating_sub(self.last_bytes);
        let speed = if elapsed > 0.0 {
            (delta as f64 / elapsed) as u64
        } else {
            0
        };
        let eta = if speed > 0 {
            total.saturating_sub(transferred).div_ceil(speed)
        } else {
            0
        };
        let progress = if total > 0 {
            (transferred as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        self.last_at = now;
        self.last_bytes = transferred;

        DownloadProgress {
            task_id: task_id.to_string(),
            progress,
            downloaded_size: transferred,
            total_size: total,
            speed,
            eta,
        }
    }
}

/// What gets copied for a request
#[derive(Debug, Clone, PartialEq)]
enum Plan {
    /// A single regular file, streamed as is
    Direct { remote_path: String, file_name: String },
    /// Packed server-side into a tar.gz first
    Archive {
        dir: String,
        names: Vec<String>,
        file_name: String,
    },
}

impl Plan {
    fn new(dir: &str, targets: &[Target]) -> Result<Self> {
        if targets.is_empty() {
            return Err(GatewayError::Validation("No files selected".into()));
        }
        let names = targets
            .iter()
            .map(|t| validate_name(&t.name).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;

        match targets {
            [single] if !single.is_dir() => Ok(Plan::Direct {
                remote_path: join_path(dir, &names[0]),
                file_name: names[0].clone(),
            }),
            [_] => Ok(Plan::Archive {
                dir: dir.to_string(),
                file_name: format!("{}.tar.gz", names[0]),
                names,
            }),
            _ => Ok(Plan::Archive {
                dir: dir.to_string(),
                names,
                file_name: format!("selected-files-{}.tar.gz", Utc::now().timestamp_millis()),
            }),
        }
    }

    fn file_name(&self) -> &str {
        match self {
            Plan::Direct { file_name, .. } | Plan::Archive { file_name, .. } => file_name,
        }
    }
}

fn new_task_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Client and task ids: ASCII alphanumerics and `-` only
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// URL path under which a finished download is served
pub fn download_url(client_id: &str, task_id: &str, file_name: &str) -> Result<String> {
    let mut url = Url::parse("http://gateway.local/")
        .map_err(|e| GatewayError::Protocol(format!("Failed to build download URL: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| GatewayError::Protocol("Failed to build download URL".into()))?
        .clear()
        .extend(["api", "downloads", client_id, task_id, file_name]);
    Ok(url.path().to_string())
}

/// Location of a finished download, if it exists and is complete
pub fn finished_file(cache_dir: &Path, client_id: &str, task_id: &str, file_name: &str) -> Option<PathBuf> {
    if !is_valid_id(client_id) || !is_valid_id(task_id) || file_name.ends_with(PART_SUFFIX) {
        return None;
    }
    let name = validate_name(file_name).ok()?;
    let path = cache_dir.join(client_id).join(task_id).join(name);
    path.is_file().then_some(path)
}

struct Inner<R: RemoteFs> {
    client_id: String,
    remote: Arc<R>,
    cache_root: PathBuf,
    remote_tmp_dir: String,
    timeout: Duration,
    tasks: Mutex<HashMap<String, Arc<TransferTask>>>,
    sink: ClientSink,
}

/// Download registry of one file session
pub struct TransferManager<R: RemoteFs> {
    inner: Arc<Inner<R>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: RemoteFs> TransferManager<R> {
    /// `cache_dir` is the gateway-wide cache; this client gets `<cache_dir>/<client_id>`
    pub fn new(
        client_id: &str,
        remote: Arc<R>,
        cache_dir: &Path,
        remote_tmp_dir: &str,
        timeout: Duration,
        sink: ClientSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client_id: client_id.to_string(),
                remote,
                cache_root: cache_dir.join(client_id),
                remote_tmp_dir: remote_tmp_dir.trim_end_matches('/').to_string(),
                timeout,
                tasks: Mutex::new(HashMap::new()),
                sink,
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.inner.cache_root
    }

    pub async fn active_tasks(&self) -> usize {
        self.inner.tasks.lock().await.len()
    }

    /// Accept a download request and run it in the background
    pub async fn start_download(&self, dir: &str, targets: &[Target]) -> Result<String> {
        let plan = Plan::new(dir, targets)?;
        let task = Arc::new(TransferTask::new(new_task_id()));
        let task_dir = self.inner.cache_root.join(&task.id);
        tokio::fs::create_dir_all(&task_dir).await?;

        info!(
            "Download {} accepted: {} ({} target(s) from {})",
            task.id,
            plan.file_name(),
            targets.len(),
            dir
        );

        self.inner
            .tasks
            .lock()
            .await
            .insert(task.id.clone(), task.clone());
        self.inner.sink.event(ServerEvent::DownloadStarted {
            task_id: task.id.clone(),
            file_name: plan.file_name().to_string(),
        });

        let inner = self.inner.clone();
        let id = task.id.clone();
        let handle = tokio::spawn(async move {
            let result = inner.execute(&task, &plan, &task_dir).await;
            inner.finalize(&task, &plan, &task_dir, result).await;
        });

        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(id)
    }

    /// Cancel a task; unknown ids are ignored
    pub async fn cancel(&self, task_id: &str) {
        match self.inner.tasks.lock().await.get(task_id) {
            Some(task) => {
                info!("Cancelling download {}", task_id);
                task.cancel.cancel();
            }
            None => debug!("Cancel for unknown download {}", task_id),
        }
    }

    /// Cancel every task, wait for their cleanup, then clear the client cache
    pub async fn shutdown(&self) {
        for task in self.inner.tasks.lock().await.values() {
            task.cancel.cancel();
        }

        let handles = std::mem::take(&mut *self.handles.lock().await);
        if !handles.is_empty() {
            debug!("Waiting for {} download task(s) to settle", handles.len());
        }
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Download task panicked: {}", e);
            }
        }

        match tokio::fs::remove_dir_all(&self.inner.cache_root).await {
            Ok(()) => debug!("Cleared cache {}", self.inner.cache_root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to clear cache {}: {}",
                self.inner.cache_root.display(),
                e
            ),
        }
    }

    #[cfg(test)]
    async fn wait_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        join_all(handles).await;
    }
}

impl<R: RemoteFs> Inner<R> {
    async fn execute(&self, task: &TransferTask, plan: &Plan, task_dir: &Path) -> Result<PathBuf> {
        if task.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let remote_path = match plan {
            Plan::Direct { remote_path, .. } => remote_path.clone(),
            Plan::Archive { dir, names, .. } => {
                let archive = format!("{}/{}.tar.gz", self.remote_tmp_dir, task.id);
                *task.remote_archive.lock().await = Some(archive.clone());

                let cmd = RemoteCommand::new("tar")
                    .arg("-czf")?
                    .arg(&archive)?
                    .args(names.iter().map(|n| format!("./{}", n)))?
                    .in_dir(dir)?;
                guarded_exec(self.remote.as_ref(), &cmd, self.timeout).await?;
                archive
            }
        };

        if task.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let total = self.remote.stat_size(&remote_path).await?;
        task.total.store(total, Ordering::Relaxed);

        let dest = task_dir.join(plan.file_name());
        self.copy_with_progress(task, &remote_path, &dest).await?;
        Ok(dest)
    }

    /// Stream `remote_path` into `dest` via a `.part` file
    async fn copy_with_progress(&self, task: &TransferTask, remote_path: &str, dest: &Path) -> Result<()> {
        let mut part = dest.as_os_str().to_owned();
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);

        let copied = async {
            let mut reader = self.remote.open_read(remote_path).await?;
            let mut file = tokio::fs::File::create(&part).await?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut meter = ProgressMeter::new(Instant::now());
            let mut ticker = tokio::time::interval_at(Instant::now() + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = task.cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = ticker.tick() => {
                        let progress = meter.sample(&task.id, Instant::now(), task.transferred(), task.total());
                        self.sink.event(ServerEvent::DownloadProgress(progress));
                    }
                    read = reader.read(&mut buf) => {
                        let n = read?;
                        if n == 0 {
                            break;
                        }
                        file.write_all(&buf[..n]).await?;
                        task.transferred.fetch_add(n as u64, Ordering::Relaxed);
                        if task.cancel.is_cancelled() {
                            return Err(GatewayError::Cancelled);
                        }
                    }
                }
            }

            file.flush().await?;
            let progress = meter.sample(&task.id, Instant::now(), task.transferred(), task.total());
            self.sink.event(ServerEvent::DownloadProgress(progress));
            Ok::<(), GatewayError>(())
        }
        .await;

        match copied {
            Ok(()) => {
                tokio::fs::rename(&part, dest).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&part).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial file {}: {}", part.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }

    /// Remote cleanup, local cleanup, registry removal, then the outcome event
    async fn finalize(&self, task: &TransferTask, plan: &Plan, task_dir: &Path, result: Result<PathBuf>) {
        let archive = task.remote_archive.lock().await.take();
        if let Some(archive) = archive {
            let removed = match RemoteCommand::new("rm").args(["-f", "--"]).and_then(|c| c.arg(&archive)) {
                Ok(cmd) => guarded_exec(self.remote.as_ref(), &cmd, self.timeout).await,
                Err(e) => Err(e),
            };
            if let Err(e) = removed {
                warn!("Failed to remove remote archive {}: {}", archive, e);
            }
        }

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_dir_all(task_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", task_dir.display(), e);
                }
            }
        }

        self.tasks.lock().await.remove(&task.id);

        let file_name = plan.file_name().to_string();
        let event = match result {
            Ok(path) => {
                info!(
                    "Download {} ready: {} bytes in {:?} ({})",
                    task.id,
                    task.transferred(),
                    task.started.elapsed(),
                    path.display()
                );
                match download_url(&self.client_id, &task.id, &file_name) {
                    Ok(url) => ServerEvent::DownloadReady {
                        task_id: task.id.clone(),
                        file_name,
                        url,
                    },
                    Err(e) => ServerEvent::DownloadFail {
                        task_id: Some(task.id.clone()),
                        message: e.to_string(),
                    },
                }
            }
            Err(GatewayError::Cancelled) => {
                info!("Download {} cancelled", task.id);
                ServerEvent::DownloadCancelled {
                    task_id: task.id.clone(),
                }
            }
            Err(e) => {
                error!("Download {} failed: {}", task.id, e);
                ServerEvent::DownloadFail {
                    task_id: Some(task.id.clone()),
                    message: e.to_string(),
                }
            }
        };
        self.sink.event(event);
    }
}
