use scan_core::{ChannelValue, CycleSnapshot, ProgramStatus, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    /// Messages that omit the version are read as 1.0.
    pub fn is_supported(&self) -> bool {
        self.major == 1 || (self.major == 0 && self.minor == 0)
    }
}

/// Periodic observation pushed to the client.
#[derive(Debug, Serialize)]
pub struct StateMsg<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub unix_us: u64,
    pub tick: u64,
    pub sim_time_ms: u64,
    pub engine_state: &'static str,
    pub inputs: &'a [ChannelValue],
    pub outputs: &'a [ChannelValue],
    pub programs: &'a [ProgramStatus],
    pub cycles_executed: u64,
    pub program_failures: u64,
    pub failures: &'a [String],
}

impl<'a> StateMsg<'a> {
    pub fn from_snapshot(snapshot: &'a CycleSnapshot, sequence: u64, unix_us: u64) -> Self {
        Self {
            msg_type: "state",
            protocol_version: ProtocolVersion::v1(),
            sequence,
            unix_us,
            tick: snapshot.tick,
            sim_time_ms: snapshot.sim_time_ms,
            engine_state: snapshot.engine_state.as_str(),
            inputs: &snapshot.inputs,
            outputs: &snapshot.outputs,
            programs: &snapshot.programs,
            cycles_executed: snapshot.cycles_executed,
            program_failures: snapshot.program_failures,
            failures: &snapshot.last_failures,
        }
    }
}

/// Answer to one inbound message.
#[derive(Debug, Serialize)]
pub struct ReplyMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub request: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ReplyMsg {
    pub fn ok(request: &'static str) -> Self {
        Self {
            msg_type: "reply",
            protocol_version: ProtocolVersion::v1(),
            request,
            sequence: None,
            ok: true,
            detail: None,
            data: None,
        }
    }

    pub fn error(request: &'static str, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
            ..Self::ok(request)
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_sequence(mut self, sequence: Option<u64>) -> Self {
        self.sequence = sequence;
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct HelloMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Fields every state-changing command carries.
#[derive(Debug, Default, Deserialize)]
pub struct CommandMeta {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Must increase strictly per connection. Zero counts as missing.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadIoMsg {
    /// `"0/in/1"`, or with the card's name: `"door/out/2"`.
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct SetInputMsg {
    #[serde(flatten)]
    pub meta: CommandMeta,
    pub channel: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct StartMsg {
    #[serde(flatten)]
    pub meta: CommandMeta,
    pub program: String,
}

#[derive(Debug)]
pub enum IncomingMessage {
    Hello(HelloMsg),
    ReadIo(ReadIoMsg),
    ListPrograms,
    SetInput(SetInputMsg),
    Start(StartMsg),
    StartAll(CommandMeta),
    Stop(CommandMeta),
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let msg_type = value.get("type")?.as_str()?;
        match msg_type {
            "hello" => serde_json::from_value(value).ok().map(IncomingMessage::Hello),
            "read_io" => serde_json::from_value(value).ok().map(IncomingMessage::ReadIo),
            "list_programs" => Some(IncomingMessage::ListPrograms),
            "set_input" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::SetInput),
            "start" => serde_json::from_value(value).ok().map(IncomingMessage::Start),
            "start_all" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::StartAll),
            "stop" => serde_json::from_value(value).ok().map(IncomingMessage::Stop),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IncomingMessage::Hello(_) => "hello",
            IncomingMessage::ReadIo(_) => "read_io",
            IncomingMessage::ListPrograms => "list_programs",
            IncomingMessage::SetInput(_) => "set_input",
            IncomingMessage::Start(_) => "start",
            IncomingMessage::StartAll(_) => "start_all",
            IncomingMessage::Stop(_) => "stop",
        }
    }

    /// Present only on commands that change the PLC.
    pub fn meta(&self) -> Option<&CommandMeta> {
        match self {
            IncomingMessage::SetInput(msg) => Some(&msg.meta),
            IncomingMessage::Start(msg) => Some(&msg.meta),
            IncomingMessage::StartAll(meta) | IncomingMessage::Stop(meta) => Some(meta),
            IncomingMessage::Hello(_) | IncomingMessage::ReadIo(_) | IncomingMessage::ListPrograms => {
                None
            }
        }
    }
}
