// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Remote filesystem seam: SFTP for file operations, exec channels for commands

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use russh::client::Handle;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use ssh_gateway_common::{DirEntry, EntryKind, GatewayError, Result};

use crate::ssh::handler::ClientHandler;

use super::join_path;

/// Output of a remote command
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
    Error(String),
}

pub type ExecStream = BoxStream<'static, ExecEvent>;

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Operations the file gateway needs from the remote host
#[async_trait]
pub trait RemoteFs: Send + Sync + 'static {
    /// Whether the underlying SSH transport is still up
    fn is_alive(&self) -> bool;

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>>;
    async fn stat_size(&self, path: &str) -> Result<u64>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn create_dir(&self, path: &str) -> Result<()>;
    async fn create_dir_all(&self, path: &str) -> Result<()>;
    async fn remove_file(&self, path: &str) -> Result<()>;
    async fn remove_dir_all(&self, path: &str) -> Result<()>;
    async fn open_read(&self, path: &str) -> Result<RemoteReader>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Start a command on an auxiliary exec channel
    async fn spawn_exec(&self, command: &str) -> Result<ExecStream>;
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

fn entry_kind(mode: u32) -> EntryKind {
    match mode & S_IFMT {
        S_IFDIR => EntryKind::Directory,
        S_IFLNK => EntryKind::Symlink,
        _ => EntryKind::File,
    }
}

/// `rwxr-xr-x` from permission bits
pub fn rights_string(mode: u32) -> String {
    const FLAGS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    FLAGS
        .iter()
        .map(|&(bit, c)| if mode & bit != 0 { c } else { '-' })
        .collect()
}

fn to_dir_entry(name: String, attrs: &FileAttributes) -> DirEntry {
    let mode = attrs.permissions.unwrap_or(0);
    DirEntry {
        kind: entry_kind(mode),
        name,
        size: attrs.size.unwrap_or(0),
        modify_time: u64::from(attrs.mtime.unwrap_or(0)) * 1000,
        access_time: u64::from(attrs.atime.unwrap_or(0)) * 1000,
        rights: rights_string(mode),
        owner: attrs.uid.unwrap_or(0),
        group: attrs.gid.unwrap_or(0),
    }
}

/// SFTP session plus the connection handle for exec channels
pub struct SftpRemote {
    sftp: SftpSession,
    handle: Arc<Handle<ClientHandler>>,
}

impl SftpRemote {
    pub fn new(sftp: SftpSession, handle: Arc<Handle<ClientHandler>>) -> Self {
        Self { sftp, handle }
    }
}

fn sftp_err(action: &str, path: &str) -> impl FnOnce(russh_sftp::client::error::Error) -> GatewayError {
    let context = format!("{} {}", action, path);
    move |e| GatewayError::Protocol(format!("{}: {}", context, e))
}

#[async_trait]
impl RemoteFs for SftpRemote {
    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(sftp_err("Failed to list", path))?;

        Ok(entries
            .filter(|e| {
                let name = e.file_name();
                name != "." && name != ".."
            })
            .map(|e| to_dir_entry(e.file_name(), &e.metadata()))
            .collect())
    }

    async fn stat_size(&self, path: &str) -> Result<u64> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(sftp_err("Failed to stat", path))?;
        Ok(attrs.size.unwrap_or(0))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.sftp
            .try_exists(path)
            .await
            .map_err(sftp_err("Failed to check", path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(sftp_err("Failed to rename", from))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(sftp_err("Failed to create directory", path))
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let mut current = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            current = join_path(&current, component);
            if !self.exists(&current).await? {
                self.create_dir(&current).await?;
            }
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(sftp_err("Failed to delete", path))
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        // Discovery order puts parents before children; remove in reverse
        let mut pending = vec![path.to_string()];
        let mut dirs = Vec::new();

        while let Some(dir) = pending.pop() {
            for entry in self.list(&dir).await? {
                let child = join_path(&dir, &entry.name);
                match entry.kind {
                    EntryKind::Directory => pending.push(child),
                    _ => self.remove_file(&child).await?,
                }
            }
            dirs.push(dir);
        }

        for dir in dirs.iter().rev() {
            self.sftp
                .remove_dir(dir.as_str())
                .await
                .map_err(sftp_err("Failed to delete directory", dir))?;
        }
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(sftp_err("Failed to open", path))?;
        Ok(Box::new(file))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.sftp
            .read(path)
            .await
            .map_err(sftp_err("Failed to read", path))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = self
            .sftp
            .create(path)
            .await
            .map_err(sftp_err("Failed to open for writing", path))?;
        file.write_all(data).await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn spawn_exec(&self, command: &str) -> Result<ExecStream> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::RemoteExec(format!("Failed to open exec channel: {}", e)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| GatewayError::RemoteExec(format!("Failed to start command: {}", e)))?;
        debug!("exec: {}", command);

        let events = stream::unfold(Some(channel), |state| async move {
            let mut channel = state?;
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        return Some((ExecEvent::Stdout(data.to_vec()), Some(channel)))
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        return Some((ExecEvent::Stderr(data.to_vec()), Some(channel)))
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        return Some((ExecEvent::Exit(exit_status), Some(channel)))
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        return Some((
                            ExecEvent::Error(format!("Command killed by signal {:?}", signal_name)),
                            None,
                        ))
                    }
                    Some(ChannelMsg::Close) | None => return None,
                    Some(_) => continue,
                }
            }
        });

        Ok(events.boxed())
    }
}
