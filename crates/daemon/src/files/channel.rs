// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// File session over `/ws/sftp`: admission, SFTP session setup and request dispatch

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ssh_gateway_common::{FileRequest, ServerEvent};

use crate::api::AppState;
use crate::client::{ClientChannel, ClientSink};

use super::ops::FileOps;
use super::remote::{RemoteFs, SftpRemote};
use super::transfer::TransferManager;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// Directory containing `path`
fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

/// Send a fresh listing of `path`, or `not_exists_dir` if it cannot be read
async fn send_listing<R: RemoteFs>(ops: &FileOps<R>, sink: &ClientSink, path: &str) {
    match ops.list(path).await {
        Ok(entries) => sink.event(ServerEvent::DirLs {
            entries,
            path: path.to_string(),
        }),
        Err(e) => {
            debug!("Listing {} failed: {}", path, e);
            sink.event(ServerEvent::NotExistsDir(e.to_string()));
        }
    }
}

/// Report once when the SSH transport under `remote` goes away, then cancel
/// `lost`. Returns early if `lost` is cancelled by the session.
async fn watch_transport<R: RemoteFs>(
    remote: Arc<R>,
    sink: ClientSink,
    every: Duration,
    lost: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = lost.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if !remote.is_alive() {
            warn!("SSH connection under file session was lost");
            sink.event(ServerEvent::SshConnectionError {
                message: "SSH connection error: connection lost".into(),
                code: "CONNECTION_LOST".into(),
            });
            lost.cancel();
            return;
        }
    }
}

/// Handle one request on an open file session
pub(crate) async fn dispatch<R: RemoteFs>(
    ops: &FileOps<R>,
    transfers: &TransferManager<R>,
    sink: &ClientSink,
    request: FileRequest,
) {
    match request {
        FileRequest::WsSftp(_) => warn!("Ignoring ws_sftp on an already open file session"),

        FileRequest::OpenDir(path) => send_listing(ops, sink, &path).await,

        FileRequest::Rename {
            dir_path,
            old_name,
            new_name,
        } => match ops.rename(&dir_path, &old_name, &new_name).await {
            Ok(()) => {
                sink.event(ServerEvent::RenameSuccess { old_name, new_name });
                send_listing(ops, sink, &dir_path).await;
            }
            Err(e) => sink.event(ServerEvent::RenameFail(e.to_string())),
        },

        FileRequest::Delete {
            dir_path,
            name,
            kind,
        } => match ops.delete(&dir_path, &name, kind).await {
            Ok(()) => {
                sink.event(ServerEvent::DeleteSuccess);
                send_listing(ops, sink, &dir_path).await;
            }
            Err(e) => sink.event(ServerEvent::DeleteFail(e.to_string())),
        },

        FileRequest::DeleteBatch { dir_path, targets } => {
            match ops.delete_batch(&dir_path, &targets).await {
                Ok(()) => {
                    sink.event(ServerEvent::DeleteSuccess);
                    send_listing(ops, sink, &dir_path).await;
                }
                Err(e) => sink.event(ServerEvent::DeleteFail(e.to_string())),
            }
        }

        FileRequest::Move {
            dir_path,
            dest_dir,
            name,
        } => match ops.move_entry(&dir_path, &dest_dir, &name).await {
            Ok(()) => {
                sink.event(ServerEvent::MoveSuccess);
                send_listing(ops, sink, &dir_path).await;
            }
            Err(e) => sink.event(ServerEvent::MoveFail(e.to_string())),
        },

        FileRequest::MoveBatch {
            dir_path,
            dest_dir,
            targets,
        } => match ops.move_batch(&dir_path, &dest_dir, &targets).await {
            Ok(()) => {
                sink.event(ServerEvent::MoveSuccess);
                send_listing(ops, sink, &dir_path).await;
            }
            Err(e) => sink.event(ServerEvent::MoveFail(e.to_string())),
        },

        FileRequest::CopyServerBatch {
            dir_path,
            dest_dir,
            targets,
        } => match ops.copy_batch(&dir_path, &dest_dir, &targets).await {
            Ok(()) => {
                sink.event(ServerEvent::CopySuccess);
                send_listing(ops, sink, &dir_path).await;
            }
            Err(e) => sink.event(ServerEvent::CopyFail(e.to_string())),
        },

        FileRequest::CreateItem {
            dir_path,
            name,
            kind,
        } => match ops.create_item(&dir_path, &name, kind).await {
            Ok(message) => {
                sink.event(ServerEvent::CreateSuccess(message));
                send_listing(ops, sink, &dir_path).await;
            }
            Err(e) => sink.event(ServerEvent::CreateFail(e.to_string())),
        },

        FileRequest::CompressFiles {
            dir_path,
            targets,
            archive_name,
        } => match ops.compress(&dir_path, &targets, &archive_name).await {
            Ok(message) => {
                sink.event(ServerEvent::CompressSuccess(message));
                send_listing(ops, sink, &dir_path).await;
            }
            Err(e) => sink.event(ServerEvent::CompressFail(e.to_string())),
        },

        FileRequest::DecompressFile {
            dir_path,
            file_name,
            mode,
            folder_name,
        } => match ops
            .decompress(&dir_path, &file_name, mode, folder_name.as_deref())
            .await
        {
            Ok(message) => {
                sink.event(ServerEvent::DecompressSuccess(message));
                send_listing(ops, sink, &dir_path).await;
            }
            Err(e) => sink.event(ServerEvent::DecompressFail(e.to_string())),
        },

        FileRequest::DownloadRequest { dir_path, targets } => {
            if let Err(e) = transfers.start_download(&dir_path, &targets).await {
                sink.event(ServerEvent::DownloadFail {
                    task_id: None,
                    message: e.to_string(),
                });
            }
        }

        FileRequest::DownloadCancel { task_id } => transfers.cancel(&task_id).await,

        FileRequest::ReadFile {
            file_path,
            file_size,
        } => match ops.read_text(&file_path, file_size).await {
            Ok(content) => sink.event(ServerEvent::FileContent { file_path, content }),
            Err(e) => sink.event(ServerEvent::FileReadError(e.to_string())),
        },

        FileRequest::SaveFile { file_path, content } => {
            match ops.write_text(&file_path, &content).await {
                Ok(()) => {
                    let dir = parent_dir(&file_path).to_string();
                    sink.event(ServerEvent::FileSaved { file_path });
                    send_listing(ops, sink, &dir).await;
                }
                Err(e) => sink.event(ServerEvent::FileSaveError(e.to_string())),
            }
        }
    }
}

/// Run one `/ws/sftp` client until it disconnects
pub async fn serve(socket: WebSocket, state: Arc<AppState>, ip: IpAddr) {
    let mut channel = ClientChannel::open(socket, ip, state.shutdown_tx.subscribe());
    let sink = channel.sink().clone();

    if !state.admit_ip(&channel) {
        channel.finish().await;
        return;
    }

    let open = match channel.next::<FileRequest>().await {
        Some(FileRequest::WsSftp(open)) => open,
        Some(_) => {
            sink.event(ServerEvent::ConnectFail(
                "Expected ws_sftp as the first message".into(),
            ));
            channel.finish().await;
            return;
        }
        None => {
            channel.finish().await;
            return;
        }
    };

    if !state.admit_token(&channel, &open.token).await {
        channel.finish().await;
        return;
    }

    let profile = match state.hosts.resolve(&open.host_id).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!("File session for unknown host {}: {}", open.host_id, e);
            sink.event(ServerEvent::ConnectFail(e.to_string()));
            channel.finish().await;
            return;
        }
    };

    // Lifecycle events only go to the log for file sessions
    let (events, mut event_rx) = mpsc::unbounded_channel();
    let host = profile.host.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!("File session to {}: {:?}", host, event);
        }
    });

    let mut session = match state.open_session(&profile, ip, &events).await {
        Ok(session) => session,
        Err(e) => {
            sink.event(ServerEvent::ConnectFail(e.to_string()));
            channel.finish().await;
            return;
        }
    };
    drop(events);

    let sftp = match session.open_sftp().await {
        Ok(sftp) => sftp,
        Err(e) => {
            sink.event(ServerEvent::ConnectFail(e.to_string()));
            session.close().await;
            channel.finish().await;
            return;
        }
    };

    let timeout = state.config.command_timeout();
    let remote = Arc::new(SftpRemote::new(sftp, session.handle()));
    let ops = FileOps::new(remote.clone(), timeout);
    let client_id = Uuid::new_v4().simple().to_string();
    let transfers = TransferManager::new(
        &client_id,
        remote,
        &state.config.cache_dir,
        &state.config.remote_tmp_dir,
        timeout,
        sink.clone(),
    );

    match ops.connect_listing().await {
        Ok((root_list, is_root_user)) => {
            info!(
                "File session {} open: {}@{} (root listing: {})",
                client_id, profile.username, profile.host, is_root_user
            );
            sink.event(ServerEvent::ConnectSuccess {
                root_list,
                is_root_user,
            });

            let lost = CancellationToken::new();
            let watcher = tokio::spawn(watch_transport(
                ops.remote().clone(),
                sink.clone(),
                LIVENESS_INTERVAL,
                lost.clone(),
            ));

            loop {
                let request = tokio::select! {
                    _ = lost.cancelled() => {
                        sink.event(ServerEvent::ConnectClose);
                        break;
                    }
                    request = channel.next::<FileRequest>() => request,
                };
                let Some(request) = request else {
                    break;
                };
                if !ops.remote().is_alive() {
                    sink.event(ServerEvent::ConnectClose);
                    break;
                }
                dispatch(&ops, &transfers, &sink, request).await;
            }

            lost.cancel();
            if let Err(e) = watcher.await {
                warn!("Transport watcher task failed: {}", e);
            }
        }
        Err(e) => sink.event(ServerEvent::ConnectFail(e.to_string())),
    }

    debug!("File session {} closing", client_id);
    transfers.shutdown().await;
    session.close().await;
    channel.finish().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{drain_events, sink};
    use crate::files::mock::MockRemote;
    use ssh_gateway_common::{CreateKind, DecompressMode, EntryKind, Target};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        ops: FileOps<MockRemote>,
        transfers: TransferManager<MockRemote>,
        sink: ClientSink,
        rx: mpsc::UnboundedReceiver<crate::client::Outbound>,
        remote: Arc<MockRemote>,
        _cache: TempDir,
    }

    fn fixture(remote: MockRemote) -> Fixture {
        let cache = TempDir::new().unwrap();
        let remote = Arc::new(remote);
        let (sink, rx) = sink();
        let timeout = Duration::from_secs(30);
        Fixture {
            ops: FileOps::new(remote.clone(), timeout),
            transfers: TransferManager::new(
                "c1",
                remote.clone(),
                cache.path(),
                "/tmp",
                timeout,
                sink.clone(),
            ),
            sink,
            rx,
            remote,
            _cache: cache,
        }
    }

    impl Fixture {
        async fn send(&mut self, request: FileRequest) -> Vec<ServerEvent> {
            dispatch(&self.ops, &self.transfers, &self.sink, request).await;
            drain_events(&mut self.rx)
        }
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/etc/motd"), "/etc");
        assert_eq!(parent_dir("/motd"), "/");
        assert_eq!(parent_dir("notes.txt"), ".");
    }

    #[tokio::test]
    async fn test_open_dir_lists_or_reports_missing() {
        let mut f = fixture(MockRemote::new().with_file("/data/a.txt", b"a"));

        let events = f.send(FileRequest::OpenDir("/data".into())).await;
        match &events[..] {
            [ServerEvent::DirLs { entries, path }] => {
                assert_eq!(path, "/data");
                assert_eq!(entries[0].name, "a.txt");
            }
            other => panic!("unexpected events {:?}", other),
        }

        let events = f.send(FileRequest::OpenDir("/nope".into())).await;
        assert!(matches!(&events[..], [ServerEvent::NotExistsDir(_)]));
    }

    #[tokio::test]
    async fn test_successful_mutation_is_followed_by_listing() {
        let mut f = fixture(MockRemote::new().with_file("/data/a.txt", b"a"));

        let events = f
            .send(FileRequest::Rename {
                dir_path: "/data".into(),
                old_name: "a.txt".into(),
                new_name: "b.txt".into(),
            })
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ServerEvent::RenameSuccess { new_name, .. } if new_name == "b.txt"
        ));
        match &events[1] {
            ServerEvent::DirLs { entries, .. } => assert_eq!(entries[0].name, "b.txt"),
            other => panic!("expected dir_ls, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_mutation_has_no_listing() {
        let mut f = fixture(MockRemote::new().with_dir("/data"));
        let events = f
            .send(FileRequest::CreateItem {
                dir_path: "/data".into(),
                name: "a/b".into(),
                kind: CreateKind::File,
            })
            .await;
        assert!(matches!(&events[..], [ServerEvent::CreateFail(_)]));
        assert!(f.remote.commands().is_empty());

        let events = f
            .send(FileRequest::Delete {
                dir_path: "/data".into(),
                name: "missing.txt".into(),
                kind: EntryKind::File,
            })
            .await;
        assert!(matches!(&events[..], [ServerEvent::DeleteFail(_)]));
    }

    #[tokio::test]
    async fn test_unsupported_archive_fails_without_command() {
        let mut f = fixture(MockRemote::new().with_file("/data/archive.rar", b"r"));
        let events = f
            .send(FileRequest::DecompressFile {
                dir_path: "/data".into(),
                file_name: "archive.rar".into(),
                mode: DecompressMode::Here,
                folder_name: None,
            })
            .await;
        match &events[..] {
            [ServerEvent::DecompressFail(message)] => {
                assert!(message.contains("Unsupported archive format"))
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(f.remote.commands().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_read_file() {
        let mut f = fixture(MockRemote::new().with_dir("/etc"));
        let events = f
            .send(FileRequest::SaveFile {
                file_path: "/etc/motd".into(),
                content: "welcome\n".into(),
            })
            .await;
        assert!(matches!(&events[0], ServerEvent::FileSaved { file_path } if file_path == "/etc/motd"));
        assert!(matches!(&events[1], ServerEvent::DirLs { path, .. } if path == "/etc"));

        let events = f
            .send(FileRequest::ReadFile {
                file_path: "/etc/motd".into(),
                file_size: 8,
            })
            .await;
        assert!(matches!(
            &events[..],
            [ServerEvent::FileContent { content, .. }] if content == "welcome\n"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_transport_is_reported_once() {
        let remote = Arc::new(MockRemote::new());
        let (sink, mut rx) = sink();
        let lost = CancellationToken::new();
        let watcher = tokio::spawn(watch_transport(
            remote.clone(),
            sink,
            Duration::from_secs(5),
            lost.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(drain_events(&mut rx).is_empty());
        assert!(!lost.is_cancelled());

        remote.set_alive(false);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(lost.is_cancelled());
        watcher.await.unwrap();
        assert_eq!(
            drain_events(&mut rx),
            vec![ServerEvent::SshConnectionError {
                message: "SSH connection error: connection lost".into(),
                code: "CONNECTION_LOST".into(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_watcher_stops_with_session() {
        let (sink, mut rx) = sink();
        let lost = CancellationToken::new();
        let watcher = tokio::spawn(watch_transport(
            Arc::new(MockRemote::new()),
            sink,
            Duration::from_secs(5),
            lost.clone(),
        ));
        lost.cancel();
        watcher.await.unwrap();
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_empty_download_request_fails_without_task() {
        let mut f = fixture(MockRemote::new().with_dir("/data"));
        let events = f
            .send(FileRequest::DownloadRequest {
                dir_path: "/data".into(),
                targets: Vec::<Target>::new(),
            })
            .await;
        assert!(matches!(
            &events[..],
            [ServerEvent::DownloadFail { task_id: None, .. }]
        ));
        assert_eq!(f.transfers.active_tasks().await, 0);
    }
}
