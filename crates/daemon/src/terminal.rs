// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Gateway Contributors

// SSH Gateway - Terminal Module
// Bridges one interactive shell onto `/ws/terminal`, with in-place reconnect

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ssh_gateway_common::{
    ConnectionProfile, PingResult, ServerEvent, TerminalRequest, WindowSize,
};

use crate::api::AppState;
use crate::client::{ClientChannel, ClientSink};
use crate::ssh::{Session, SessionEvent};

const PING_TIMEOUT: Duration = Duration::from_millis(2500);
const SSH_PORT: u16 = 22;

/// Keystrokes and window changes bound for the shell
#[derive(Debug)]
enum PumpInput {
    Data(Vec<u8>),
    Resize(WindowSize),
}

/// A running shell pump: owns the session and its channel
struct Pump {
    input: mpsc::UnboundedSender<PumpInput>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Pump {
    /// Stop the pump and wait until its session is closed
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Terminal pump task failed: {}", e);
        }
    }
}

/// Where client input goes; empty while a reconnect is in progress
struct Routing {
    pump: Option<Pump>,
    size: WindowSize,
}

impl Routing {
    fn new(size: WindowSize) -> Self {
        Self { pump: None, size }
    }

    /// Forward keystrokes; returns false if they were dropped
    fn input(&self, data: Vec<u8>) -> bool {
        match &self.pump {
            Some(pump) => pump.input.send(PumpInput::Data(data)).is_ok(),
            None => false,
        }
    }

    /// Remember the size for the next shell and apply it to the current one
    fn resize(&mut self, size: WindowSize) {
        self.size = size;
        if let Some(pump) = &self.pump {
            let _ = pump.input.send(PumpInput::Resize(size));
        }
    }

    fn attach(&mut self, pump: Pump) -> Option<Pump> {
        self.pump.replace(pump)
    }

    fn detach(&mut self) -> Option<Pump> {
        self.pump.take()
    }
}

/// Lines shown in the terminal before connecting
fn print_info(profile: &ConnectionProfile) -> Vec<String> {
    vec![
        format!("Connecting to {} - {}", profile.name, profile.host),
        format!(
            "ssh {}@{} -p {} -> {}",
            profile.username, profile.host, profile.port, profile.auth_type
        ),
    ]
}

/// Client-facing notices for a session lifecycle event
fn notices(event: &SessionEvent, profile: &ConnectionProfile) -> Vec<ServerEvent> {
    match event {
        SessionEvent::HopConnected { index, host } => vec![ServerEvent::TerminalPrintInfo(
            format!("Jump host {} connected: {}", index, host),
        )],
        SessionEvent::Authenticating { host } => {
            vec![ServerEvent::TerminalPrintInfo(format!("Authenticating to {}", host))]
        }
        SessionEvent::Ready => vec![
            ServerEvent::TerminalPrintInfo(format!(
                "Connected: {} - {}",
                profile.name, profile.host
            )),
            ServerEvent::ConnectTerminalSuccess(format!("Connected to {}", profile.host)),
        ],
        SessionEvent::Error(message) => vec![ServerEvent::ConnectFail(message.clone())],
        SessionEvent::Connecting { .. } | SessionEvent::Closed => Vec::new(),
    }
}

/// Connect to the profile's target and start a shell pump
async fn connect_shell(
    state: &AppState,
    profile: &ConnectionProfile,
    ip: IpAddr,
    size: WindowSize,
    sink: &ClientSink,
) -> Option<Pump> {
    for line in print_info(profile) {
        sink.event(ServerEvent::TerminalPrintInfo(line));
    }
    info!("Opening terminal to {} for {}", profile.host, ip);

    let (events, mut event_rx) = mpsc::unbounded_channel();
    let forward = |event: SessionEvent| {
        for notice in notices(&event, profile) {
            sink.event(notice);
        }
    };

    // Relay progress while connecting, keeping it ordered before the shell notice
    let connect = state.open_session(profile, ip, &events);
    tokio::pin!(connect);
    let result = loop {
        tokio::select! {
            biased;
            Some(event) = event_rx.recv() => forward(event),
            result = &mut connect => break result,
        }
    };
    while let Ok(event) = event_rx.try_recv() {
        forward(event);
    }

    let mut session = result.ok()?;
    let shell = match session.open_shell(size).await {
        Ok(shell) => shell,
        Err(e) => {
            warn!("Failed to open shell on {}: {}", profile.host, e);
            sink.event(ServerEvent::ConnectFail(e.to_string()));
            session.close().await;
            return None;
        }
    };
    sink.event(ServerEvent::ConnectShellSuccess);

    let (input, input_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_pump(
        session,
        shell,
        input_rx,
        cancel.clone(),
        sink.clone(),
    ));
    Some(Pump {
        input,
        cancel,
        task,
    })
}

async fn run_pump(
    session: Session,
    mut shell: Channel<Msg>,
    mut input: mpsc::UnboundedReceiver<PumpInput>,
    cancel: CancellationToken,
    sink: ClientSink,
) {
    let host = session.profile().host.clone();

    let remote_closed = loop {
        tokio::select! {
            _ = cancel.cancelled() => break false,

            msg = shell.wait() => match msg {
                Some(ChannelMsg::Data { data }) => sink.binary(data.to_vec()),
                Some(ChannelMsg::ExtendedData { data, .. }) => sink.binary(data.to_vec()),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Shell on {} exited with status {}", host, exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break true,
                Some(_) => {}
            },

            Some(cmd) = input.recv() => match cmd {
                PumpInput::Data(bytes) => {
                    if !session.is_open() {
                        warn!("Dropping input for closed session on {}", host);
                    } else if let Err(e) = shell.data(&bytes[..]).await {
                        warn!("Failed to write to shell on {}: {}", host, e);
                    }
                }
                PumpInput::Resize(size) => {
                    if let Err(e) = shell.window_change(size.cols, size.rows, 0, 0).await {
                        warn!("Failed to resize terminal on {}: {}", host, e);
                    } else {
                        debug!("Terminal on {} resized to {}x{}", host, size.cols, size.rows);
                    }
                }
            },
        }
    };

    session.close().await;
    if remote_closed {
        info!("Remote shell on {} closed", host);
        sink.event(ServerEvent::ConnectClose);
    }
}

/// Split `host` or `host:port` into a dial target, defaulting to the SSH port
fn ping_target(target: &str) -> (String, u16) {
    let target = target.trim();
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return (ip.to_string(), SSH_PORT);
    }
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (target.to_string(), SSH_PORT),
        },
        None => (target.to_string(), SSH_PORT),
    }
}

/// Time a TCP handshake with the target
async fn ping(target: &str, limit: Duration) -> PingResult {
    let failed = |msg: String| PingResult {
        success: false,
        time: None,
        msg: Some(msg),
    };

    let (host, port) = ping_target(target);
    if host.is_empty() {
        return failed("No host to ping".into());
    }

    let started = Instant::now();
    match tokio::time::timeout(limit, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(_)) => PingResult {
            success: true,
            time: Some(started.elapsed().as_millis() as u64),
            msg: None,
        },
        Ok(Err(e)) => {
            debug!("Ping to {}:{} failed: {}", host, port, e);
            failed(e.to_string())
        }
        Err(_) => failed(format!("Timed out after {} ms", limit.as_millis())),
    }
}

/// Attach the first shell; `None` when the initial connection failed
async fn start_routing<F, Fut>(connect: F, size: WindowSize) -> Option<Arc<Mutex<Routing>>>
where
    F: FnOnce(WindowSize) -> Fut,
    Fut: Future<Output = Option<Pump>>,
{
    let pump = connect(size).await?;
    let mut routing = Routing::new(size);
    routing.attach(pump);
    Some(Arc::new(Mutex::new(routing)))
}

/// Replace the current shell with a fresh one from `connect`
///
/// Input is dropped from the moment the old shell is detached until the new
/// one is attached. Cancelling `closing` abandons the reconnect.
async fn reconnect<F, Fut>(
    connect: F,
    delay: Duration,
    routing: Arc<Mutex<Routing>>,
    sink: ClientSink,
    closing: CancellationToken,
) where
    F: FnOnce(WindowSize) -> Fut,
    Fut: Future<Output = Option<Pump>>,
{
    let old = routing.lock().await.detach();
    if let Some(pump) = old {
        pump.stop().await;
    }

    let pump = tokio::select! {
        _ = closing.cancelled() => return,
        pump = async {
            tokio::time::sleep(delay).await;
            let size = routing.lock().await.size;
            connect(size).await
        } => pump,
    };
    let Some(pump) = pump else {
        return;
    };

    let mut routing = routing.lock().await;
    if closing.is_cancelled() {
        drop(routing);
        pump.stop().await;
        return;
    }
    if let Some(stale) = routing.attach(pump) {
        warn!("Replacing a shell that was attached during reconnect");
        stale.stop().await;
    }
    sink.event(ServerEvent::ReconnectTerminalSuccess);
}

/// Run one `/ws/terminal` client until it disconnects
pub async fn serve(socket: WebSocket, state: Arc<AppState>, ip: IpAddr) {
    let mut channel = ClientChannel::open(socket, ip, state.shutdown_tx.subscribe());
    let sink = channel.sink().clone();

    if !state.admit_ip(&channel) {
        channel.finish().await;
        return;
    }

    let open = match channel.next::<TerminalRequest>().await {
        Some(TerminalRequest::Create(open)) => open,
        Some(_) => {
            sink.event(ServerEvent::CreateFail(
                "Expected create as the first message".into(),
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
            warn!("Terminal requested for unknown host {}: {}", open.host_id, e);
            sink.event(ServerEvent::CreateFail(e.to_string()));
            channel.finish().await;
            return;
        }
    };

    let defaults = WindowSize::default();
    let size = WindowSize {
        cols: open.cols.unwrap_or(defaults.cols),
        rows: open.rows.unwrap_or(defaults.rows),
    };
    let shell_connector = || {
        let (state, profile, sink) = (state.clone(), profile.clone(), sink.clone());
        move |size| async move { connect_shell(&state, &profile, ip, size, &sink).await }
    };

    // connect_shell has already reported the failure
    let Some(routing) = start_routing(shell_connector(), size).await else {
        channel.finish().await;
        return;
    };

    let closing = CancellationToken::new();
    let mut reconnecting: Option<JoinHandle<()>> = None;

    while let Some(request) = channel.next::<TerminalRequest>().await {
        match request {
            TerminalRequest::Input(keys) => {
                if !routing.lock().await.input(keys.into_bytes()) {
                    debug!("Dropping input while no shell is attached");
                }
            }
            TerminalRequest::Resize(size) => routing.lock().await.resize(size),
            TerminalRequest::ReconnectTerminal => {
                if reconnecting.as_ref().is_some_and(|task| !task.is_finished()) {
                    debug!("Reconnect already in progress for {}", profile.host);
                    continue;
                }
                info!("Reconnecting terminal to {}", profile.host);
                reconnecting = Some(tokio::spawn(reconnect(
                    shell_connector(),
                    state.config.reconnect_delay(),
                    routing.clone(),
                    sink.clone(),
                    closing.clone(),
                )));
            }
            TerminalRequest::GetPing(target) => {
                let sink = sink.clone();
                tokio::spawn(async move {
                    sink.event(ServerEvent::PingData(ping(&target, PING_TIMEOUT).await));
                });
            }
            TerminalRequest::Create(_) => {
                warn!("Ignoring create on an already open terminal")
            }
        }
    }

    debug!("Terminal client {} disconnected", ip);
    closing.cancel();
    if let Some(task) = reconnecting {
        if let Err(e) = task.await {
            error!("Terminal reconnect task failed: {}", e);
        }
    }
    let pump = routing.lock().await.detach();
    if let Some(pump) = pump {
        pump.stop().await;
    }
    channel.finish().await;
}
