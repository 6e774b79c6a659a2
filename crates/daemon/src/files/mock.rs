// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// In-memory remote filesystem for file gateway tests

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::DuplexStream;

use ssh_gateway_common::{DirEntry, EntryKind, GatewayError, Result};

use super::remote::{rights_string, ExecEvent, ExecStream, RemoteFs, RemoteReader};

/// How spawned commands behave
#[derive(Debug, Clone)]
pub enum Script {
    /// Interpret `touch`, `tar -c*f`, `mkdir` and `rm` against the in-memory tree, then exit 0
    Interpret,
    /// Replay these events verbatim
    Events(Vec<ExecEvent>),
    /// Never produce output or exit
    Hang,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    failing: HashSet<&'static str>,
    /// Writers kept alive so that held reads never complete
    held: Vec<DuplexStream>,
    hold_reads: bool,
}

pub struct MockRemote {
    state: Mutex<State>,
    script: Mutex<Script>,
    alive: AtomicBool,
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

fn base(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl MockRemote {
    pub fn new() -> Self {
        let mut state = State::default();
        state.dirs.insert("/".to_string());
        Self {
            state: Mutex::new(state),
            script: Mutex::new(Script::Interpret),
            alive: AtomicBool::new(true),
        }
    }

    pub fn with_dir(self, path: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let mut current = String::new();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                current = format!("{}/{}", current, part);
                state.dirs.insert(current.clone());
            }
        }
        self
    }

    pub fn with_file(self, path: &str, data: &[u8]) -> Self {
        let this = self.with_dir(parent(path));
        this.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.to_vec());
        this
    }

    pub fn script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Make the named operation (e.g. "rename", "list") fail
    pub fn fail(&self, op: &'static str) {
        self.state.lock().unwrap().failing.insert(op);
    }

    /// Reads opened from now on block forever
    pub fn hold_reads(&self) {
        self.state.lock().unwrap().hold_reads = true;
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state.lock().unwrap().files.contains_key(path)
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    fn check(&self, op: &'static str, path: &str) -> Result<()> {
        if self.state.lock().unwrap().failing.contains(op) {
            return Err(GatewayError::Protocol(format!("{} {}: Permission denied", op, path)));
        }
        Ok(())
    }

    fn interpret(&self, command: &str) {
        let Some(words) = shlex::split(command) else {
            return;
        };
        let (cwd, argv) = match words.iter().position(|w| w == "&&") {
            Some(i) if words.first().map(String::as_str) == Some("cd") => {
                (words.get(1).cloned(), words[i + 1..].to_vec())
            }
            _ => (None, words),
        };
        let resolve = |p: &str| -> String {
            let p = p.strip_prefix("./").unwrap_or(p);
            match (&cwd, p.starts_with('/')) {
                (Some(dir), false) => format!("{}/{}", dir.trim_end_matches('/'), p),
                _ => p.to_string(),
            }
        };

        let mut state = self.state.lock().unwrap();
        match argv.first().map(String::as_str) {
            Some("touch") => {
                for path in argv.iter().skip(1).filter(|a| *a != "--") {
                    state.files.insert(resolve(path), Vec::new());
                }
            }
            Some("mkdir") => {
                for path in argv.iter().skip(1).filter(|a| !a.starts_with('-')) {
                    state.dirs.insert(resolve(path));
                }
            }
            Some("tar") if argv.get(1).is_some_and(|f| f.starts_with("-c")) => {
                if let Some(archive) = argv.get(2) {
                    state.files.insert(resolve(archive), b"ARCHIVE-BYTES".to_vec());
                }
            }
            Some("rm") => {
                for path in argv.iter().skip(1).filter(|a| !a.starts_with('-')) {
                    state.files.remove(&resolve(path));
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RemoteFs for MockRemote {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.check("list", path)?;
        let state = self.state.lock().unwrap();
        if !state.dirs.contains(path) {
            return Err(GatewayError::Protocol(format!("No such file: {}", path)));
        }
        let dirs = state
            .dirs
            .iter()
            .filter(|d| d.as_str() != "/" && parent(d) == path)
            .map(|d| (base(d).to_string(), EntryKind::Directory, 4096, 0o755));
        let files = state
            .files
            .iter()
            .filter(|(f, _)| parent(f) == path)
            .map(|(f, data)| (base(f).to_string(), EntryKind::File, data.len() as u64, 0o644));

        Ok(dirs
            .chain(files)
            .map(|(name, kind, size, mode)| DirEntry {
                kind,
                name,
                size,
                modify_time: 0,
                access_time: 0,
                rights: rights_string(mode),
                owner: 0,
                group: 0,
            })
            .collect())
    }

    async fn stat_size(&self, path: &str) -> Result<u64> {
        self.check("stat", path)?;
        let state = self.state.lock().unwrap();
        match state.files.get(path) {
            Some(data) => Ok(data.len() as u64),
            None if state.dirs.contains(path) => Ok(4096),
            None => Err(GatewayError::Protocol(format!("No such file: {}", path))),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.check("rename", from)?;
        let mut state = self.state.lock().unwrap();
        if let Some(data) = state.files.remove(from) {
            state.files.insert(to.to_string(), data);
            return Ok(());
        }
        if state.dirs.contains(from) {
            let prefix = format!("{}/", from);
            let moved_dirs: Vec<String> = state
                .dirs
                .iter()
                .filter(|d| *d == from || d.starts_with(&prefix))
                .cloned()
                .collect();
            for d in moved_dirs {
                state.dirs.remove(&d);
                state.dirs.insert(format!("{}{}", to, &d[from.len()..]));
            }
            let moved_files: Vec<String> = state
                .files
                .keys()
                .filter(|f| f.starts_with(&prefix))
                .cloned()
                .collect();
            for f in moved_files {
                if let Some(data) = state.files.remove(&f) {
                    state.files.insert(format!("{}{}", to, &f[from.len()..]), data);
                }
            }
            return Ok(());
        }
        Err(GatewayError::Protocol(format!("No such file: {}", from)))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.check("create_dir", path)?;
        self.state.lock().unwrap().dirs.insert(path.to_string());
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        self.check("create_dir", path)?;
        let mut state = self.state.lock().unwrap();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = format!("{}/{}", current, part);
            state.dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.check("remove", path)?;
        match self.state.lock().unwrap().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(GatewayError::Protocol(format!("No such file: {}", path))),
        }
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        self.check("remove", path)?;
        let mut state = self.state.lock().unwrap();
        if !state.dirs.remove(path) {
            return Err(GatewayError::Protocol(format!("No such directory: {}", path)));
        }
        let prefix = format!("{}/", path);
        state.dirs.retain(|d| !d.starts_with(&prefix));
        state.files.retain(|f, _| !f.starts_with(&prefix));
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader> {
        self.check("read", path)?;
        let mut state = self.state.lock().unwrap();
        if state.hold_reads {
            let (reader, writer) = tokio::io::duplex(64);
            state.held.push(writer);
            return Ok(Box::new(reader));
        }
        match state.files.get(path) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(GatewayError::Protocol(format!("No such file: {}", path))),
        }
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.check("read", path)?;
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| GatewayError::Protocol(format!("No such file: {}", path)))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check("write", path)?;
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn spawn_exec(&self, command: &str) -> Result<ExecStream> {
        self.state
            .lock()
            .unwrap()
            .commands
            .push(command.to_string());

        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Interpret => {
                self.interpret(command);
                Ok(stream::iter(vec![ExecEvent::Exit(0)]).boxed())
            }
            Script::Events(events) => Ok(stream::iter(events).boxed()),
            Script::Hang => Ok(stream::pending().boxed()),
        }
    }
}
