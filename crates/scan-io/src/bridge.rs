use crate::auth::{AuthConfig, TokenValidator};
use crate::metrics::{
    AUTH_FAILURES, AUTH_MISSING, BRIDGE_COMMANDS_ACCEPTED, BRIDGE_COMMANDS_REJECTED,
    BRIDGE_CONNECTED, COMMANDS_OUT_OF_ORDER,
};
use crate::protocol::{HelloMsg, IncomingMessage, ReplyMsg, StateMsg};
use scan_core::{ControlCommand, ControlSender, CycleExchange, InputUpdate, IoLayout};
use serde_json::json;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{atomic::AtomicBool, Arc};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

/// A client that stops reading is dropped once this much output is queued.
const MAX_PENDING_BYTES: usize = 256 * 1024;

pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
    pub auth: AuthConfig,
    pub require_handshake: bool,
    /// How long a command waits for the engine to apply it.
    pub command_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            publish_interval: Duration::from_millis(100),
            auth: AuthConfig::default(),
            require_handshake: false,
            command_timeout: Duration::from_millis(500),
        }
    }
}

/// Outcome of one state-changing command, for audit trails.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub request: &'static str,
    pub client_id: Option<String>,
    pub sequence: u64,
    pub accepted: bool,
    pub detail: Option<String>,
}

pub type CommandHook = Arc<dyn Fn(&CommandRecord) + Send + Sync>;

/// What the bridge needs from the running PLC.
#[derive(Clone)]
pub struct BridgeContext {
    pub exchange: Arc<CycleExchange>,
    pub control: ControlSender,
    pub layout: Arc<IoLayout>,
    pub on_command: Option<CommandHook>,
}

#[derive(Debug)]
struct InboundState {
    last_sequence: Option<u64>,
    handshake_seen: bool,
    capabilities: Vec<String>,
    client_id: Option<String>,
}

impl InboundState {
    fn new() -> Self {
        Self {
            last_sequence: None,
            handshake_seen: false,
            capabilities: Vec::new(),
            client_id: None,
        }
    }

    fn reset(&mut self) {
        self.last_sequence = None;
        self.handshake_seen = false;
        self.capabilities.clear();
        self.client_id = None;
    }

    fn accept_sequence(&mut self, sequence: u64) -> bool {
        if sequence == 0 {
            warn!("Command sequence missing or zero");
            return false;
        }
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                warn!(sequence, last_sequence = last, "Out-of-order command sequence");
                return false;
            }
        }
        self.last_sequence = Some(sequence);
        true
    }

    fn note_handshake(&mut self, hello: &HelloMsg) {
        self.handshake_seen = true;
        self.capabilities = hello.capabilities.clone();
        self.client_id = hello.client_id.clone();
    }

    fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("anonymous")
    }
}

/// JSON-lines control and observation endpoint. Serves one client at a time.
pub struct Bridge {
    listener: TcpListener,
    config: BridgeConfig,
}

impl Bridge {
    pub fn bind(config: BridgeConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(self, ctx: BridgeContext, stop: Arc<AtomicBool>) {
        let config = &self.config;
        info!(
            addr = %config.bind_addr,
            auth = config.auth.enabled,
            require_handshake = config.require_handshake,
            "Bridge listening"
        );

        let validator = if config.auth.enabled {
            Some(TokenValidator::from_config(&config.auth))
        } else {
            None
        };

        let mut client: Option<TcpStream> = None;
        let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut send_buf: Vec<u8> = Vec::new();
        let mut send_offset: usize = 0;
        let mut last_publish = Instant::now();
        let mut state_sequence: u64 = 0;
        let mut inbound_state = InboundState::new();

        loop {
            if stop.load(std::sync::atomic::Ordering::Relaxed) {
                break;
            }
            if client.is_none() {
                match self.listener.accept() {
                    Ok((stream, addr)) => match stream.set_nonblocking(true) {
                        Ok(()) => {
                            info!(client_addr = %addr, "Bridge client connected");
                            client = Some(stream);
                            BRIDGE_CONNECTED.set(1.0);
                        }
                        Err(e) => warn!(error = %e, "Failed to set client nonblocking"),
                    },
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!("Bridge accept error: {}", err);
                    }
                }
            }

            let mut drop_client = false;
            if let Some(stream) = client.as_mut() {
                let mut temp = [0u8; 1024];
                match stream.read(&mut temp) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        recv_buf.extend_from_slice(&temp[..n]);
                        while let Some(pos) = recv_buf.iter().position(|b| *b == b'\n') {
                            let line = recv_buf.drain(..=pos).collect::<Vec<u8>>();
                            let Ok(text) = std::str::from_utf8(&line) else {
                                warn!("Dropping non UTF-8 line");
                                continue;
                            };
                            let trimmed = text.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            let Some(msg) = IncomingMessage::parse(trimmed) else {
                                warn!(line = %trimmed, "Dropping unrecognised message");
                                continue;
                            };
                            let reply = handle_incoming(
                                msg,
                                &ctx,
                                &validator,
                                config,
                                &mut inbound_state,
                            );
                            queue_line(&mut send_buf, &reply);
                        }
                        if recv_buf.len() > MAX_PENDING_BYTES {
                            warn!("Client sent an oversized line");
                            drop_client = true;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge read error");
                        drop_client = true;
                    }
                }

                // Publish state
                if send_buf.is_empty() && last_publish.elapsed() >= config.publish_interval {
                    state_sequence = state_sequence.wrapping_add(1);
                    let snapshot = ctx.exchange.read();
                    let msg = StateMsg::from_snapshot(&snapshot, state_sequence, unix_us());
                    queue_line(&mut send_buf, &msg);
                    last_publish = Instant::now();
                }

                if !send_buf.is_empty() && !drop_client {
                    match stream.write(&send_buf[send_offset..]) {
                        Ok(0) => {
                            info!("Bridge client disconnected");
                            drop_client = true;
                        }
                        Ok(n) => {
                            send_offset += n;
                            if send_offset >= send_buf.len() {
                                send_buf.clear();
                                send_offset = 0;
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            warn!(error = %err, "Bridge write error");
                            drop_client = true;
                        }
                    }
                }
                if send_buf.len() > MAX_PENDING_BYTES {
                    warn!("Client is not reading, dropping it");
                    drop_client = true;
                }
            }

            if drop_client {
                client = None;
                recv_buf.clear();
                send_buf.clear();
                send_offset = 0;
                inbound_state.reset();
                BRIDGE_CONNECTED.set(0.0);
            }

            std::thread::sleep(Duration::from_millis(5));
        }
        BRIDGE_CONNECTED.set(0.0);
    }
}

fn queue_line<T: serde::Serialize>(send_buf: &mut Vec<u8>, msg: &T) {
    match serde_json::to_vec(msg) {
        Ok(line) => {
            send_buf.extend_from_slice(&line);
            send_buf.push(b'\n');
        }
        Err(e) => warn!(error = %e, "Failed to encode outbound message"),
    }
}

fn unix_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[instrument(skip_all, fields(request = msg.kind()))]
fn handle_incoming(
    msg: IncomingMessage,
    ctx: &BridgeContext,
    validator: &Option<TokenValidator>,
    config: &BridgeConfig,
    inbound_state: &mut InboundState,
) -> ReplyMsg {
    let request = msg.kind();
    if let Some(meta) = msg.meta() {
        let sequence = meta.sequence;
        if let Err(detail) = admit_command(meta, validator, config, inbound_state) {
            BRIDGE_COMMANDS_REJECTED.inc();
            notify(ctx, inbound_state, request, sequence, false, Some(detail.clone()));
            return ReplyMsg::error(request, detail).with_sequence(Some(sequence));
        }
    }

    match msg {
        IncomingMessage::Hello(hello) => {
            if !hello.protocol_version.is_supported() {
                warn!(
                    major = hello.protocol_version.major,
                    minor = hello.protocol_version.minor,
                    "Unsupported protocol version"
                );
                return ReplyMsg::error(request, "unsupported protocol version");
            }
            inbound_state.note_handshake(&hello);
            info!(
                client_id = ?hello.client_id,
                capabilities = ?hello.capabilities,
                "Bridge handshake received"
            );
            ReplyMsg::ok(request)
        }
        IncomingMessage::ReadIo(read) => {
            let channel = match ctx.layout.resolve(&read.channel) {
                Ok(channel) => channel,
                Err(e) => return ReplyMsg::error(request, e.to_string()),
            };
            let snapshot = ctx.exchange.read();
            let value = snapshot
                .inputs
                .iter()
                .chain(snapshot.outputs.iter())
                .find(|cv| cv.channel == channel)
                .map(|cv| cv.value);
            match value {
                Some(value) => ReplyMsg::ok(request).with_data(json!({
                    "channel": channel,
                    "value": value,
                    "tick": snapshot.tick,
                })),
                None => ReplyMsg::error(request, format!("channel {channel} not published")),
            }
        }
        IncomingMessage::ListPrograms => {
            let snapshot = ctx.exchange.read();
            ReplyMsg::ok(request).with_data(json!({
                "engine_state": snapshot.engine_state.as_str(),
                "programs": snapshot.programs,
            }))
        }
        IncomingMessage::SetInput(set) => {
            let sequence = set.meta.sequence;
            let command = match ctx.layout.resolve(&set.channel) {
                Ok(channel) if channel.is_input() => Ok(ControlCommand::SetInput(
                    InputUpdate::new(channel, set.value),
                )),
                Ok(channel) => Err(format!("channel {channel} is not an input")),
                Err(e) => Err(e.to_string()),
            };
            match command {
                Ok(command) => submit(ctx, config, inbound_state, command, sequence),
                Err(detail) => {
                    BRIDGE_COMMANDS_REJECTED.inc();
                    notify(ctx, inbound_state, request, sequence, false, Some(detail.clone()));
                    ReplyMsg::error(request, detail).with_sequence(Some(sequence))
                }
            }
        }
        IncomingMessage::Start(start) => submit(
            ctx,
            config,
            inbound_state,
            ControlCommand::Start(start.program),
            start.meta.sequence,
        ),
        IncomingMessage::StartAll(meta) => submit(
            ctx,
            config,
            inbound_state,
            ControlCommand::StartAll,
            meta.sequence,
        ),
        IncomingMessage::Stop(meta) => {
            submit(ctx, config, inbound_state, ControlCommand::Stop, meta.sequence)
        }
    }
}

/// Version, handshake, sequence and token checks for state-changing commands.
fn admit_command(
    meta: &crate::protocol::CommandMeta,
    validator: &Option<TokenValidator>,
    config: &BridgeConfig,
    inbound_state: &mut InboundState,
) -> Result<(), String> {
    if !meta.protocol_version.is_supported() {
        warn!(
            major = meta.protocol_version.major,
            minor = meta.protocol_version.minor,
            "Unsupported protocol version"
        );
        return Err("unsupported protocol version".to_string());
    }

    if config.require_handshake && !inbound_state.handshake_seen {
        warn!("Command received before handshake");
        return Err("handshake required".to_string());
    }

    if !inbound_state.accept_sequence(meta.sequence) {
        COMMANDS_OUT_OF_ORDER.inc();
        return Err("sequence must increase".to_string());
    }

    if let Some(val) = validator {
        match &meta.auth_token {
            Some(token) => {
                if let Err(e) = val.validate(token, inbound_state.client_id()) {
                    warn!(error = %e, "Invalid auth token");
                    AUTH_FAILURES.inc();
                    return Err(format!("auth failed: {e}"));
                }
            }
            None => {
                warn!("Missing auth token");
                AUTH_MISSING.inc();
                return Err("auth token required".to_string());
            }
        }
    }
    Ok(())
}

fn submit(
    ctx: &BridgeContext,
    config: &BridgeConfig,
    inbound_state: &InboundState,
    command: ControlCommand,
    sequence: u64,
) -> ReplyMsg {
    let request = command.label();
    debug!(?command, sequence, "Forwarding command to engine");
    match ctx.control.request(command, config.command_timeout) {
        Ok(()) => {
            BRIDGE_COMMANDS_ACCEPTED.inc();
            notify(ctx, inbound_state, request, sequence, true, None);
            ReplyMsg::ok(request).with_sequence(Some(sequence))
        }
        Err(e) => {
            warn!(error = %e, request, "Engine rejected command");
            BRIDGE_COMMANDS_REJECTED.inc();
            notify(ctx, inbound_state, request, sequence, false, Some(e.to_string()));
            ReplyMsg::error(request, e.to_string()).with_sequence(Some(sequence))
        }
    }
}

fn notify(
    ctx: &BridgeContext,
    inbound_state: &InboundState,
    request: &'static str,
    sequence: u64,
    accepted: bool,
    detail: Option<String>,
) {
    if let Some(hook) = &ctx.on_command {
        hook(&CommandRecord {
            request,
            client_id: inbound_state.client_id.clone(),
            sequence,
            accepted,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_must_strictly_increase() {
        let mut state = InboundState::new();
        assert!(!state.accept_sequence(0));
        assert!(state.accept_sequence(1));
        assert!(state.accept_sequence(5));
        assert!(!state.accept_sequence(5));
        assert!(!state.accept_sequence(3));
        state.reset();
        assert!(state.accept_sequence(1));
    }

    #[test]
    fn anonymous_until_hello() {
        let mut state = InboundState::new();
        assert_eq!(state.client_id(), "anonymous");
        state.note_handshake(&HelloMsg {
            protocol_version: crate::protocol::ProtocolVersion::v1(),
            capabilities: vec!["control.v1".into()],
            client_id: Some("hmi-1".into()),
        });
        assert!(state.handshake_seen);
        assert_eq!(state.client_id(), "hmi-1");
    }
}
