use scan_core::{ChannelRef, CycleSnapshot, EngineState, ChannelValue, ProgramStatus, Value};
use scan_io::protocol::{IncomingMessage, ProtocolVersion, ReplyMsg, StateMsg};

#[test]
fn parses_hello_message() {
    let raw = r#"{
        "type":"hello",
        "protocol_version":{"major":1,"minor":0},
        "capabilities":["control.v1","auth.hmac-sha256"],
        "client_id":"test-client"
    }"#;

    let msg = IncomingMessage::parse(raw).expect("hello should parse");
    match msg {
        IncomingMessage::Hello(hello) => {
            assert!(hello.protocol_version.is_supported());
            assert_eq!(hello.client_id.as_deref(), Some("test-client"));
            assert_eq!(hello.capabilities.len(), 2);
        }
        _ => panic!("expected hello message"),
    }
}

#[test]
fn parses_set_input_with_bool_and_analog_values() {
    let raw = r#"{
        "type":"set_input",
        "protocol_version":{"major":1,"minor":0},
        "sequence":7,
        "channel":"0/in/2",
        "value":true
    }"#;
    let Some(IncomingMessage::SetInput(msg)) = IncomingMessage::parse(raw) else {
        panic!("expected set_input message");
    };
    assert_eq!(msg.meta.sequence, 7);
    assert_eq!(msg.meta.protocol_version, ProtocolVersion::v1());
    assert_eq!(msg.channel, "0/in/2");
    assert_eq!(msg.value, Value::Bool(true));
    assert!(msg.meta.auth_token.is_none());

    let raw = r#"{"type":"set_input","sequence":8,"channel":"tank/in/1","value":2.5,"auth_token":"abc"}"#;
    let Some(IncomingMessage::SetInput(msg)) = IncomingMessage::parse(raw) else {
        panic!("expected set_input message");
    };
    assert_eq!(msg.value, Value::Analog(2.5));
    assert_eq!(msg.meta.auth_token.as_deref(), Some("abc"));
    // A missing version reads as 1.0.
    assert!(msg.meta.protocol_version.is_supported());
}

#[test]
fn parses_engine_commands() {
    let Some(IncomingMessage::Start(start)) =
        IncomingMessage::parse(r#"{"type":"start","sequence":1,"program":"garage-door"}"#)
    else {
        panic!("expected start message");
    };
    assert_eq!(start.program, "garage-door");
    assert_eq!(start.meta.sequence, 1);

    let msg = IncomingMessage::parse(r#"{"type":"stop","sequence":2}"#).unwrap();
    assert_eq!(msg.kind(), "stop");
    assert_eq!(msg.meta().map(|m| m.sequence), Some(2));

    let msg = IncomingMessage::parse(r#"{"type":"start_all","sequence":3}"#).unwrap();
    assert_eq!(msg.kind(), "start_all");

    let msg = IncomingMessage::parse(r#"{"type":"list_programs"}"#).unwrap();
    assert!(msg.meta().is_none());

    let msg = IncomingMessage::parse(r#"{"type":"read_io","channel":"0/out/1"}"#).unwrap();
    assert_eq!(msg.kind(), "read_io");
    assert!(msg.meta().is_none());
}

#[test]
fn rejects_unknown_or_incomplete_messages() {
    assert!(IncomingMessage::parse(r#"{"type":"recommendation","sequence":1}"#).is_none());
    assert!(IncomingMessage::parse(r#"{"sequence":1}"#).is_none());
    assert!(IncomingMessage::parse(r#"{"type":"start","sequence":1}"#).is_none());
    assert!(IncomingMessage::parse(r#"{"type":"set_input","channel":"0/in/1"}"#).is_none());
    assert!(IncomingMessage::parse("not json").is_none());
}

#[test]
fn future_major_version_is_unsupported() {
    let raw = r#"{"type":"hello","protocol_version":{"major":2,"minor":0}}"#;
    let Some(IncomingMessage::Hello(hello)) = IncomingMessage::parse(raw) else {
        panic!("expected hello message");
    };
    assert!(!hello.protocol_version.is_supported());
}

#[test]
fn reply_omits_empty_fields() {
    let ok = serde_json::to_value(ReplyMsg::ok("hello")).unwrap();
    assert_eq!(ok["type"], "reply");
    assert_eq!(ok["ok"], true);
    assert_eq!(ok["request"], "hello");
    assert!(ok.get("detail").is_none());
    assert!(ok.get("sequence").is_none());

    let err = serde_json::to_value(
        ReplyMsg::error("start", "program 'x' not found").with_sequence(Some(4)),
    )
    .unwrap();
    assert_eq!(err["ok"], false);
    assert_eq!(err["sequence"], 4);
    assert_eq!(err["detail"], "program 'x' not found");
}

#[test]
fn state_message_carries_cycle_snapshot() {
    let snapshot = CycleSnapshot {
        tick: 12,
        sim_time_ms: 600,
        engine_state: EngineState::Running,
        inputs: vec![ChannelValue {
            channel: ChannelRef::input(0, 0),
            value: Value::Bool(true),
        }],
        outputs: vec![ChannelValue {
            channel: ChannelRef::output(0, 1),
            value: Value::Analog(1.5),
        }],
        programs: vec![ProgramStatus {
            name: "garage-door".into(),
            state: Some("Opening".into()),
        }],
        cycles_executed: 12,
        ..CycleSnapshot::default()
    };

    let msg = serde_json::to_value(StateMsg::from_snapshot(&snapshot, 3, 1_700_000_000)).unwrap();
    assert_eq!(msg["type"], "state");
    assert_eq!(msg["sequence"], 3);
    assert_eq!(msg["tick"], 12);
    assert_eq!(msg["engine_state"], "running");
    assert_eq!(msg["inputs"][0]["channel"], "0/in/1");
    assert_eq!(msg["inputs"][0]["value"], true);
    assert_eq!(msg["outputs"][0]["channel"], "0/out/2");
    assert_eq!(msg["outputs"][0]["value"], 1.5);
    assert_eq!(msg["programs"][0]["state"], "Opening");
    assert_eq!(msg["failures"].as_array().map(Vec::len), Some(0));
}
