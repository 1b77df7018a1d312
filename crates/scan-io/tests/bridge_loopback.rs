use scan_core::door::{garage_door_program, DoorWorld, PROGRAM_NAME};
use scan_core::{BasicIoCard, IoCard, MasterConfig, PlcMaster};
use scan_io::bridge::{Bridge, BridgeConfig, BridgeContext};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to bridge");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    fn send(&mut self, msg: Value) {
        writeln!(self.stream, "{msg}").unwrap();
    }

    fn next_line(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Skips state messages until the next reply.
    fn reply(&mut self) -> Value {
        loop {
            let msg = self.next_line();
            if msg["type"] == "reply" {
                return msg;
            }
        }
    }

    fn request(&mut self, msg: Value) -> Value {
        self.send(msg);
        self.reply()
    }
}

#[test]
fn operator_drives_the_door_over_the_bridge() {
    let cards: Vec<Box<dyn IoCard>> = vec![Box::new(BasicIoCard::new("door"))];
    let mut master = PlcMaster::new(&cards, MasterConfig::default()).unwrap();
    master.load_program(garage_door_program().unwrap()).unwrap();
    let mut world = DoorWorld::default();
    master.prepare(&mut world).unwrap();
    let layout = master.store().shared_layout();
    let handle = master.spawn(world, None);

    let commands = Arc::new(Mutex::new(Vec::new()));
    let hook_log = Arc::clone(&commands);
    let ctx = BridgeContext {
        exchange: handle.exchange(),
        control: handle.control(),
        layout,
        on_command: Some(Arc::new(move |record: &scan_io::CommandRecord| {
            hook_log
                .lock()
                .unwrap()
                .push((record.request, record.accepted));
        })),
    };
    let bridge = Bridge::bind(BridgeConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        publish_interval: Duration::from_millis(20),
        ..BridgeConfig::default()
    })
    .unwrap();
    let addr = bridge.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let bridge_stop = Arc::clone(&stop);
    let bridge_thread = thread::spawn(move || bridge.run(ctx, bridge_stop));

    let mut client = Client::connect(addr);

    let reply = client.request(json!({
        "type": "hello",
        "protocol_version": {"major": 1, "minor": 0},
        "client_id": "hmi-test"
    }));
    assert_eq!(reply["ok"], true);

    let reply = client.request(json!({
        "type": "set_input", "sequence": 1, "channel": "door/in/1", "value": true
    }));
    assert_eq!(reply["ok"], true, "{reply}");

    let reply = client.request(json!({"type": "read_io", "channel": "0/in/1"}));
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["value"], true);

    let reply = client.request(json!({
        "type": "set_input", "sequence": 2, "channel": "0/out/1", "value": true
    }));
    assert_eq!(reply["ok"], false);

    let reply = client.request(json!({"type": "stop", "sequence": 2}));
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["detail"], "sequence must increase");

    let reply = client.request(json!({"type": "start", "sequence": 3, "program": "nope"}));
    assert_eq!(reply["ok"], false);

    let reply = client.request(json!({"type": "start", "sequence": 4, "program": PROGRAM_NAME}));
    assert_eq!(reply["ok"], true, "{reply}");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "door never reported Open");
        let msg = client.next_line();
        if msg["type"] == "state" && msg["programs"][0]["state"] == "Open" {
            assert_eq!(msg["engine_state"], "running");
            break;
        }
    }

    let reply = client.request(json!({"type": "list_programs"}));
    assert_eq!(reply["data"]["programs"][0]["name"], PROGRAM_NAME);

    let reply = client.request(json!({"type": "stop", "sequence": 5}));
    assert_eq!(reply["ok"], true);

    stop.store(true, Ordering::Relaxed);
    bridge_thread.join().unwrap();
    handle.shutdown();
    let outcome = handle.join().unwrap();
    assert!(outcome.environment.is_open());

    let commands = commands.lock().unwrap();
    assert_eq!(
        *commands,
        vec![
            ("set_input", true),
            ("set_input", false),
            ("stop", false),
            ("start", false),
            ("start", true),
            ("stop", true),
        ]
    );
}
