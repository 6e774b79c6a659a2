// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// File operations: SFTP where the protocol covers it, guarded commands otherwise

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use ssh_gateway_common::{
    CreateKind, DecompressMode, DirEntry, EntryKind, GatewayError, Result, Target,
};

use super::exec::{guarded_exec, path_arg, RemoteCommand};
use super::remote::RemoteFs;
use super::{join_path, validate_name};

/// Ceiling for text read into or saved from the editor
pub const MAX_TEXT_SIZE: u64 = 1024 * 1024;

/// Archive formats understood by compress and decompress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    const EXTENSIONS: [(&'static str, ArchiveFormat); 4] = [
        (".tar.gz", ArchiveFormat::TarGz),
        (".tgz", ArchiveFormat::TarGz),
        (".tar", ArchiveFormat::Tar),
        (".zip", ArchiveFormat::Zip),
    ];

    pub fn detect(name: &str) -> Option<(ArchiveFormat, &'static str)> {
        let lower = name.to_ascii_lowercase();
        Self::EXTENSIONS
            .iter()
            .find(|(ext, _)| lower.ends_with(ext) && lower.len() > ext.len())
            .map(|&(ext, format)| (format, ext))
    }

    /// Archive name without its extension
    pub fn stem(name: &str) -> Option<&str> {
        let (_, ext) = Self::detect(name)?;
        Some(&name[..name.len() - ext.len()])
    }
}

fn unsupported(name: &str) -> GatewayError {
    GatewayError::Validation(format!(
        "Unsupported archive format: {} (expected .tar.gz, .tgz, .tar or .zip)",
        name
    ))
}

fn validate_targets(targets: &[Target]) -> Result<Vec<&str>> {
    if targets.is_empty() {
        return Err(GatewayError::Validation("No files selected".into()));
    }
    targets.iter().map(|t| validate_name(&t.name)).collect()
}

/// Moving within the same directory would rename an entry onto itself
fn reject_same_dir(dir: &str, dest_dir: &str) -> Result<()> {
    let normalize = |p: &str| match p.trim_end_matches('/') {
        "" if p.starts_with('/') => "/".to_string(),
        trimmed => trimmed.to_string(),
    };
    if normalize(dir) == normalize(dest_dir.trim()) {
        return Err(GatewayError::Validation(
            "Destination is the same as the source directory".into(),
        ));
    }
    Ok(())
}

/// File operations for one file session
pub struct FileOps<R: RemoteFs> {
    remote: Arc<R>,
    timeout: Duration,
}

impl<R: RemoteFs> Clone for FileOps<R> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            timeout: self.timeout,
        }
    }
}

impl<R: RemoteFs> FileOps<R> {
    pub fn new(remote: Arc<R>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.remote.list(path).await
    }

    /// Listing shown right after connecting: `/` for users who can read it,
    /// otherwise the login directory. Returns whether `/` was readable.
    pub async fn connect_listing(&self) -> Result<(Vec<DirEntry>, bool)> {
        match self.remote.list("/").await {
            Ok(entries) => Ok((entries, true)),
            Err(e) => {
                debug!("Root listing unavailable ({}), using login directory", e);
                Ok((self.remote.list(".").await?, false))
            }
        }
    }

    pub async fn rename(&self, dir: &str, old_name: &str, new_name: &str) -> Result<()> {
        let old_name = validate_name(old_name)?;
        let new_name = validate_name(new_name)?;
        if old_name == new_name {
            return Err(GatewayError::Validation(
                "New name is the same as the old name".into(),
            ));
        }
        self.remote
            .rename(&join_path(dir, old_name), &join_path(dir, new_name))
            .await
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        if !self.remote.exists(path).await? {
            info!("Creating destination directory {}", path);
            self.remote.create_dir_all(path).await?;
        }
        Ok(())
    }

    pub async fn move_entry(&self, dir: &str, dest_dir: &str, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        reject_same_dir(dir, dest_dir)?;
        self.ensure_dir(dest_dir).await?;
        self.remote
            .rename(&join_path(dir, name), &join_path(dest_dir, name))
            .await
    }

    pub async fn move_batch(&self, dir: &str, dest_dir: &str, targets: &[Target]) -> Result<()> {
        let names = validate_targets(targets)?;
        reject_same_dir(dir, dest_dir)?;
        self.ensure_dir(dest_dir).await?;
        for name in names {
            self.remote
                .rename(&join_path(dir, name), &join_path(dest_dir, name))
                .await?;
        }
        Ok(())
    }

    pub async fn delete(&self, dir: &str, name: &str, kind: EntryKind) -> Result<()> {
        let path = join_path(dir, validate_name(name)?);
        match kind {
            EntryKind::Directory => self.remote.remove_dir_all(&path).await,
            _ => self.remote.remove_file(&path).await,
        }
    }

    /// Sequential; stops at the first failure
    pub async fn delete_batch(&self, dir: &str, targets: &[Target]) -> Result<()> {
        validate_targets(targets)?;
        for target in targets {
            self.delete(dir, &target.name, target.kind).await?;
        }
        Ok(())
    }

    pub async fn copy_batch(&self, dir: &str, dest_dir: &str, targets: &[Target]) -> Result<()> {
        let names = validate_targets(targets)?;
        self.ensure_dir(dest_dir).await?;

        let sources: Vec<String> = names.iter().map(|n| join_path(dir, n)).collect();
        let dest = format!("{}/", dest_dir.trim_end_matches('/'));
        let cmd = RemoteCommand::new("cp")
            .args(["-r", "--"])?
            .args(&sources)?
            .arg(&dest)?;
        guarded_exec(self.remote.as_ref(), &cmd, self.timeout).await
    }

    pub async fn create_item(&self, dir: &str, name: &str, kind: CreateKind) -> Result<String> {
        let name = validate_name(name)?;
        let path = join_path(dir, name);
        if self.remote.exists(&path).await? {
            return Err(GatewayError::Validation(format!("{} already exists", name)));
        }

        match kind {
            CreateKind::Folder => {
                self.remote.create_dir(&path).await?;
                Ok(format!("Folder {} created", name))
            }
            CreateKind::File => {
                let cmd = RemoteCommand::new("touch").arg("--")?.arg(&path)?;
                guarded_exec(self.remote.as_ref(), &cmd, self.timeout).await?;
                Ok(format!("File {} created", name))
            }
        }
    }

    pub async fn compress(
        &self,
        dir: &str,
        targets: &[Target],
        archive_name: &str,
    ) -> Result<String> {
        let names = validate_targets(targets)?;
        let archive_name = validate_name(archive_name)?;
        let (format, _) = ArchiveFormat::detect(archive_name).ok_or_else(|| unsupported(archive_name))?;

        if self.remote.exists(&join_path(dir, archive_name)).await? {
            return Err(GatewayError::Validation(format!(
                "{} already exists",
                archive_name
            )));
        }

        let archive = format!("./{}", archive_name);
        let members = names.iter().map(|n| format!("./{}", n));
        let cmd = match format {
            ArchiveFormat::TarGz => RemoteCommand::new("tar").arg("-czf")?,
            ArchiveFormat::Tar => RemoteCommand::new("tar").arg("-cf")?,
            ArchiveFormat::Zip => RemoteCommand::new("zip").args(["-r", "-q"])?,
        }
        .in_dir(dir)?
        .arg(&archive)?
        .args(members)?;

        guarded_exec(self.remote.as_ref(), &cmd, self.timeout).await?;
        info!("Compressed {} item(s) into {}", names.len(), join_path(dir, archive_name));
        Ok(format!("Created {}", archive_name))
    }

    pub async fn decompress(
        &self,
        dir: &str,
        file_name: &str,
        mode: DecompressMode,
        folder_name: Option<&str>,
    ) -> Result<String> {
        let file_name = validate_name(file_name)?;
        let (format, _) = ArchiveFormat::detect(file_name).ok_or_else(|| unsupported(file_name))?;
        let archive = path_arg(&join_path(dir, file_name));

        let dest = match mode {
            DecompressMode::Here => dir.to_string(),
            DecompressMode::Folder => {
                let folder = match folder_name.map(str::trim).filter(|f| !f.is_empty()) {
                    Some(f) => validate_name(f)?,
                    None => ArchiveFormat::stem(file_name).ok_or_else(|| unsupported(file_name))?,
                };
                let dest = join_path(dir, folder);
                if self.remote.exists(&dest).await? {
                    return Err(GatewayError::Validation(format!(
                        "Folder {} already exists",
                        folder
                    )));
                }
                self.remote.create_dir(&dest).await?;
                dest
            }
        };
        let dest = path_arg(&dest);

        let cmd = match format {
            ArchiveFormat::TarGz => RemoteCommand::new("tar")
                .arg("-xzf")?
                .arg(&archive)?
                .arg("-C")?
                .arg(&dest)?,
            ArchiveFormat::Tar => RemoteCommand::new("tar")
                .arg("-xf")?
                .arg(&archive)?
                .arg("-C")?
                .arg(&dest)?,
            ArchiveFormat::Zip => RemoteCommand::new("unzip")
                .args(["-o", "-q"])?
                .arg(&archive)?
                .arg("-d")?
                .arg(&dest)?,
        };

        guarded_exec(self.remote.as_ref(), &cmd, self.timeout).await?;
        Ok(format!("Extracted {} to {}", file_name, dest))
    }

    /// Read a text file of at most `MAX_TEXT_SIZE` bytes
    pub async fn read_text(&self, path: &str, declared_size: u64) -> Result<String> {
        let limit = |what: &str| GatewayError::ResourceLimit {
            what: what.to_string(),
            limit: MAX_TEXT_SIZE,
        };

        if declared_size > MAX_TEXT_SIZE {
            return Err(limit("File"));
        }
        if self.remote.stat_size(path).await? > MAX_TEXT_SIZE {
            return Err(limit("File"));
        }

        let data = self.remote.read_file(path).await?;
        if data.len() as u64 > MAX_TEXT_SIZE {
            warn!("{} grew past the size limit while reading", path);
            return Err(limit("File"));
        }

        match String::from_utf8(data) {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!("{} is not valid UTF-8, replacing invalid sequences", path);
                Ok(String::from_utf8_lossy(e.as_bytes()).into_owned())
            }
        }
    }

    pub async fn write_text(&self, path: &str, content: &str) -> Result<()> {
        if content.len() as u64 > MAX_TEXT_SIZE {
            return Err(GatewayError::ResourceLimit {
                what: "File content".to_string(),
                limit: MAX_TEXT_SIZE,
            });
        }
        self.remote.write_file(path, content.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::mock::{MockRemote, Script};
    use crate::files::remote::ExecEvent;

    fn ops(remote: MockRemote) -> (FileOps<MockRemote>, Arc<MockRemote>) {
        let remote = Arc::new(remote);
        (FileOps::new(remote.clone(), Duration::from_secs(30)), remote)
    }

    fn file(name: &str) -> Target {
        Target {
            name: name.to_string(),
            kind: EntryKind::File,
        }
    }

    fn dir(name: &str) -> Target {
        Target {
            name: name.to_string(),
            kind: EntryKind::Directory,
        }
    }

    #[test]
    fn test_archive_format_detection() {
        assert_eq!(ArchiveFormat::detect("a.tar.gz").unwrap().0, ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect("A.TGZ").unwrap().0, ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect("a.tar").unwrap().0, ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::detect("a.zip").unwrap().0, ArchiveFormat::Zip);
        assert!(ArchiveFormat::detect("a.rar").is_none());
        assert!(ArchiveFormat::detect(".zip").is_none());
        assert_eq!(ArchiveFormat::stem("backup.tar.gz"), Some("backup"));
    }

    #[tokio::test]
    async fn test_connect_listing_falls_back_to_login_dir() {
        let (ops, remote) = ops(MockRemote::new().with_dir("/etc"));
        let (entries, is_root) = ops.connect_listing().await.unwrap();
        assert!(is_root);
        assert_eq!(entries[0].name, "etc");

        remote.fail("list");
        assert!(ops.connect_listing().await.is_err());
    }

    #[tokio::test]
    async fn test_rename_rejects_identical_or_empty_names() {
        let (ops, remote) = ops(MockRemote::new().with_file("/data/a.txt", b"x"));
        assert!(ops.rename("/data", "a.txt", "a.txt").await.is_err());
        assert!(ops.rename("/data", "a.txt", "  ").await.is_err());

        ops.rename("/data", "a.txt", "b.txt").await.unwrap();
        assert!(remote.has_file("/data/b.txt"));
        assert!(!remote.has_file("/data/a.txt"));
    }

    #[tokio::test]
    async fn test_move_batch_creates_destination() {
        let (ops, remote) = ops(
            MockRemote::new()
                .with_file("/data/a.txt", b"a")
                .with_file("/data/logs/x.log", b"x"),
        );
        ops.move_batch("/data", "/archive/2024", &[file("a.txt"), dir("logs")])
            .await
            .unwrap();
        assert!(remote.has_dir("/archive/2024"));
        assert!(remote.has_file("/archive/2024/a.txt"));
        assert!(remote.has_file("/archive/2024/logs/x.log"));
    }

    #[tokio::test]
    async fn test_move_into_same_directory_is_rejected() {
        let (ops, remote) = ops(MockRemote::new().with_file("/data/a.txt", b"a"));
        for dest in ["/data", "/data/", " /data"] {
            let err = ops.move_entry("/data", dest, "a.txt").await.unwrap_err();
            assert!(matches!(err, GatewayError::Validation(_)), "dest {:?}", dest);
        }
        assert!(ops
            .move_batch("/", "/", &[file("a.txt")])
            .await
            .is_err());
        assert!(remote.has_file("/data/a.txt"));

        ops.move_entry("/data", "/data/sub", "a.txt").await.unwrap();
        assert!(remote.has_file("/data/sub/a.txt"));
    }

    #[tokio::test]
    async fn test_delete_batch_recurses_and_stops_at_first_failure() {
        let (ops, remote) = ops(
            MockRemote::new()
                .with_file("/data/a.txt", b"a")
                .with_file("/data/logs/x.log", b"x"),
        );
        ops.delete_batch("/data", &[dir("logs"), file("a.txt")])
            .await
            .unwrap();
        assert!(!remote.has_dir("/data/logs"));
        assert!(!remote.has_file("/data/logs/x.log"));
        assert!(!remote.has_file("/data/a.txt"));

        let err = ops
            .delete_batch("/data", &[file("missing"), file("other")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_copy_batch_runs_quoted_cp() {
        let (ops, remote) = ops(MockRemote::new().with_file("/data/my file", b"a"));
        ops.copy_batch("/data", "/backup", &[file("my file"), dir("-logs")])
            .await
            .unwrap();
        assert!(remote.has_dir("/backup"));
        let commands = remote.commands();
        assert_eq!(
            shlex::split(&commands[0]).unwrap(),
            vec!["cp", "-r", "--", "/data/my file", "/data/-logs", "/backup/"]
        );
    }

    #[tokio::test]
    async fn test_create_item_validates_before_remote_calls() {
        let (ops, remote) = ops(MockRemote::new().with_dir("/data"));
        let err = ops
            .create_item("/data", "a/b", CreateKind::File)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(remote.commands().is_empty());
    }

    #[tokio::test]
    async fn test_create_item_file_and_folder() {
        let (ops, remote) = ops(MockRemote::new().with_dir("/data"));
        ops.create_item("/data", "notes.md", CreateKind::File)
            .await
            .unwrap();
        assert!(remote.has_file("/data/notes.md"));
        assert_eq!(remote.commands(), vec!["touch -- /data/notes.md"]);

        ops.create_item("/data", "docs", CreateKind::Folder)
            .await
            .unwrap();
        assert!(remote.has_dir("/data/docs"));

        assert!(ops
            .create_item("/data", "docs", CreateKind::Folder)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_compress_builds_tar_command_in_dir() {
        let (ops, remote) = ops(MockRemote::new().with_file("/data/a.txt", b"a"));
        ops.compress("/data", &[file("a.txt"), dir("logs")], "out.tar.gz")
            .await
            .unwrap();
        assert_eq!(
            remote.commands(),
            vec!["cd /data && tar -czf ./out.tar.gz ./a.txt ./logs"]
        );
        assert!(remote.has_file("/data/out.tar.gz"));

        let err = ops
            .compress("/data", &[file("a.txt")], "out.tar.gz")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_decompress_rejects_unsupported_format() {
        let (ops, remote) = ops(MockRemote::new().with_file("/data/archive.rar", b"r"));
        let err = ops
            .decompress("/data", "archive.rar", DecompressMode::Here, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported archive format"));
        assert!(remote.commands().is_empty());
    }

    #[tokio::test]
    async fn test_decompress_into_default_folder() {
        let (ops, remote) = ops(MockRemote::new().with_file("/data/site.zip", b"z"));
        ops.decompress("/data", "site.zip", DecompressMode::Folder, None)
            .await
            .unwrap();
        assert!(remote.has_dir("/data/site"));
        assert_eq!(
            remote.commands(),
            vec!["unzip -o -q /data/site.zip -d /data/site"]
        );

        let err = ops
            .decompress("/data", "site.zip", DecompressMode::Folder, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_failed_command_surfaces_stderr() {
        let (ops, remote) = ops(MockRemote::new().with_file("/data/a.tgz", b"z"));
        remote.script(Script::Events(vec![
            ExecEvent::Stderr(b"gzip: stdin: not in gzip format".to_vec()),
            ExecEvent::Exit(2),
        ]));
        let err = ops
            .decompress("/data", "a.tgz", DecompressMode::Here, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "gzip: stdin: not in gzip format");
    }

    #[tokio::test]
    async fn test_text_save_then_read() {
        let (ops, _remote) = ops(MockRemote::new().with_dir("/etc"));
        ops.write_text("/etc/motd", "hello\n").await.unwrap();
        assert_eq!(ops.read_text("/etc/motd", 6).await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_oversized_text_is_rejected_without_io() {
        let (ops, remote) = ops(MockRemote::new().with_dir("/etc"));
        let big = "x".repeat(MAX_TEXT_SIZE as usize + 1);
        let err = ops.write_text("/etc/big", &big).await.unwrap_err();
        assert!(matches!(err, GatewayError::ResourceLimit { .. }));
        assert!(!remote.has_file("/etc/big"));

        let err = ops
            .read_text("/etc/big", MAX_TEXT_SIZE + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ResourceLimit { .. }));
    }

    #[tokio::test]
    async fn test_read_checks_actual_size() {
        let data = vec![b'a'; MAX_TEXT_SIZE as usize + 10];
        let (ops, _remote) = ops(MockRemote::new().with_file("/var/log/big.log", &data));
        let err = ops.read_text("/var/log/big.log", 10).await.unwrap_err();
        assert!(matches!(err, GatewayError::ResourceLimit { .. }));
    }

    #[tokio::test]
    async fn test_non_utf8_text_is_decoded_lossily() {
        let (ops, _remote) = ops(MockRemote::new().with_file("/data/latin1.txt", b"caf\xe9\n"));
        let text = ops.read_text("/data/latin1.txt", 5).await.unwrap();
        assert_eq!(text, "caf\u{fffd}\n");
    }
}
