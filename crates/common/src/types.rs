// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// Wire protocol and shared types for SSH Gateway
//
// Every WebSocket text frame is `{"event": "<name>", "data": <payload>}`.
// Terminal output travels as binary frames and has no variant here.

use serde::{Deserialize, Serialize};

/// Authentication type for SSH connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    /// Password authentication
    Password,
    /// SSH private key (PEM stored in the secrets backend)
    PrivateKey,
    /// Keyboard-interactive, answered with the single stored secret
    KeyboardInteractive,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthType::Password => "password",
            AuthType::PrivateKey => "privateKey",
            AuthType::KeyboardInteractive => "keyboardInteractive",
        };
        f.write_str(s)
    }
}

/// Kind of a directory entry, using the `ls -l` type letters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EntryKind {
    #[serde(rename = "d")]
    Directory,
    #[default]
    #[serde(rename = "-")]
    File,
    #[serde(rename = "l")]
    Symlink,
}

/// One row of a directory listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub name: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch
    pub modify_time: u64,
    pub access_time: u64,
    /// Permission string, e.g. `rwxr-xr-x`
    pub rights: String,
    pub owner: u32,
    pub group: u32,
}

/// A selected entry in a batch request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: EntryKind,
}

impl Target {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// What `create_item` should create
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CreateKind {
    File,
    Folder,
}

/// Where `decompress_file` extracts to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecompressMode {
    /// Into the archive's own directory
    Here,
    /// Into a new folder next to the archive
    Folder,
}

/// First message on either WebSocket endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    pub host_id: String,
    pub token: String,
    #[serde(default)]
    pub cols: Option<u32>,
    #[serde(default)]
    pub rows: Option<u32>,
}

/// Terminal window size in character cells
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u32,
    pub cols: u32,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Messages accepted on `/ws/terminal`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TerminalRequest {
    Create(OpenRequest),
    Input(String),
    Resize(WindowSize),
    ReconnectTerminal,
    /// Reachability check of `host` or `host:port` (port 22 by default)
    GetPing(String),
}

/// Messages accepted on `/ws/sftp`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum FileRequest {
    WsSftp(OpenRequest),
    OpenDir(String),
    Rename {
        dir_path: String,
        old_name: String,
        new_name: String,
    },
    Delete {
        dir_path: String,
        name: String,
        #[serde(rename = "type", default)]
        kind: EntryKind,
    },
    DeleteBatch {
        dir_path: String,
        targets: Vec<Target>,
    },
    Move {
        dir_path: String,
        dest_dir: String,
        name: String,
    },
    MoveBatch {
        dir_path: String,
        dest_dir: String,
        targets: Vec<Target>,
    },
    CopyServerBatch {
        dir_path: String,
        dest_dir: String,
        targets: Vec<Target>,
    },
    CreateItem {
        dir_path: String,
        name: String,
        #[serde(rename = "type")]
        kind: CreateKind,
    },
    CompressFiles {
        dir_path: String,
        targets: Vec<Target>,
        archive_name: String,
    },
    DecompressFile {
        dir_path: String,
        file_name: String,
        mode: DecompressMode,
        #[serde(default)]
        folder_name: Option<String>,
    },
    DownloadRequest {
        dir_path: String,
        targets: Vec<Target>,
    },
    DownloadCancel {
        task_id: String,
    },
    ReadFile {
        file_path: String,
        file_size: u64,
    },
    SaveFile {
        file_path: String,
        content: String,
    },
}

/// Periodic progress report for a transfer task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub task_id: String,
    /// Percentage in [0, 100]
    pub progress: f64,
    pub downloaded_size: u64,
    pub total_size: u64,
    /// Bytes per second over the last tick
    pub speed: u64,
    /// Estimated seconds remaining
    pub eta: u64,
}

/// Result of a `get_ping` reachability check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub success: bool,
    /// Round trip of the TCP handshake in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// Events sent from the gateway to the browser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    // Channel admission
    IpForbidden(String),
    TokenVerifyFail,

    // Session lifecycle
    TerminalPrintInfo(String),
    ConnectTerminalSuccess(String),
    ConnectShellSuccess,
    ConnectSuccess {
        root_list: Vec<DirEntry>,
        is_root_user: bool,
    },
    ConnectFail(String),
    ConnectClose,
    CreateFail(String),
    ReconnectTerminalSuccess,
    PingData(PingResult),
    /// The SSH transport of a file session went away
    SshConnectionError {
        message: String,
        code: String,
    },

    // File operations
    DirLs {
        entries: Vec<DirEntry>,
        path: String,
    },
    NotExistsDir(String),
    RenameSuccess {
        old_name: String,
        new_name: String,
    },
    RenameFail(String),
    DeleteSuccess,
    DeleteFail(String),
    MoveSuccess,
    MoveFail(String),
    CopySuccess,
    CopyFail(String),
    CreateSuccess(String),
    CompressSuccess(String),
    CompressFail(String),
    DecompressSuccess(String),
    DecompressFail(String),
    FileContent {
        file_path: String,
        content: String,
    },
    FileReadError(String),
    FileSaved {
        file_path: String,
    },
    FileSaveError(String),

    // Transfer tasks
    DownloadStarted {
        task_id: String,
        file_name: String,
    },
    DownloadProgress(DownloadProgress),
    DownloadReady {
        task_id: String,
        file_name: String,
        url: String,
    },
    DownloadCancelled {
        task_id: String,
    },
    DownloadFail {
        task_id: Option<String>,
        message: String,
    },
}

impl ServerEvent {
    /// Wire name of the event, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::IpForbidden(_) => "ip_forbidden",
            ServerEvent::TokenVerifyFail => "token_verify_fail",
            ServerEvent::TerminalPrintInfo(_) => "terminal_print_info",
            ServerEvent::ConnectTerminalSuccess(_) => "connect_terminal_success",
            ServerEvent::ConnectShellSuccess => "connect_shell_success",
            ServerEvent::ConnectSuccess { .. } => "connect_success",
            ServerEvent::ConnectFail(_) => "connect_fail",
            ServerEvent::ConnectClose => "connect_close",
            ServerEvent::CreateFail(_) => "create_fail",
            ServerEvent::ReconnectTerminalSuccess => "reconnect_terminal_success",
            ServerEvent::PingData(_) => "ping_data",
            ServerEvent::SshConnectionError { .. } => "ssh_connection_error",
            ServerEvent::DirLs { .. } => "dir_ls",
            ServerEvent::NotExistsDir(_) => "not_exists_dir",
            ServerEvent::RenameSuccess { .. } => "rename_success",
            ServerEvent::RenameFail(_) => "rename_fail",
            ServerEvent::DeleteSuccess => "delete_success",
            ServerEvent::DeleteFail(_) => "delete_fail",
            ServerEvent::MoveSuccess => "move_success",
            ServerEvent::MoveFail(_) => "move_fail",
            ServerEvent::CopySuccess => "copy_success",
            ServerEvent::CopyFail(_) => "copy_fail",
            ServerEvent::CreateSuccess(_) => "create_success",
            ServerEvent::CompressSuccess(_) => "compress_success",
            ServerEvent::CompressFail(_) => "compress_fail",
            ServerEvent::DecompressSuccess(_) => "decompress_success",
            ServerEvent::DecompressFail(_) => "decompress_fail",
            ServerEvent::FileContent { .. } => "file_content",
            ServerEvent::FileReadError(_) => "file_read_error",
            ServerEvent::FileSaved { .. } => "file_saved",
            ServerEvent::FileSaveError(_) => "file_save_error",
            ServerEvent::DownloadStarted { .. } => "download_started",
            ServerEvent::DownloadProgress(_) => "download_progress",
            ServerEvent::DownloadReady { .. } => "download_ready",
            ServerEvent::DownloadCancelled { .. } => "download_cancelled",
            ServerEvent::DownloadFail { .. } => "download_fail",
        }
    }
}
