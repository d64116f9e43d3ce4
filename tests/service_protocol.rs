use courier::Service;
use courier::dispatch::{DispatchTable, required_str};
use courier::error::CommandError;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::io::{self, Cursor, Write};
use std::rc::Rc;

fn run(service: &Service, requests: &[&str]) -> Vec<Value> {
    let sink = Rc::new(RefCell::new(Vec::<u8>::new()));
    let writer = SharedWriter(sink.clone());

    let input = requests
        .iter()
        .map(|line| format!("{line}\n"))
        .collect::<String>();
    service.handle(Cursor::new(input), writer).unwrap();

    let output = sink.borrow();
    output
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice::<Value>(line).unwrap())
        .collect()
}

#[test]
fn echo_returns_message() {
    let service = Service::new(DispatchTable::with_builtins());
    let lines = run(
        &service,
        &[r#"{"command_name": "echo", "arguments": {"msg": "hi"}}"#],
    );
    assert_eq!(lines, vec![json!({"result": "hi"})]);
}

#[test]
fn unknown_command_keeps_session_open() {
    let service = Service::new(DispatchTable::with_builtins());
    let lines = run(
        &service,
        &[
            r#"{"command_name": "nope", "arguments": {}}"#,
            r#"{"command_name": "echo", "arguments": {"msg": "still here"}}"#,
        ],
    );
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], json!({"error": "unknown command: nope"}));
    assert_eq!(lines[1], json!({"result": "still here"}));
}

#[test]
fn malformed_request_keeps_session_open() {
    let service = Service::new(DispatchTable::with_builtins());
    let lines = run(
        &service,
        &[
            r#"{"command_name": "echo", "argu"#,
            "not json at all",
            r#"{"command_name": "echo", "arguments": {"msg": 1}}"#,
        ],
    );
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], json!({"error": "malformed request"}));
    assert_eq!(lines[1], json!({"error": "malformed request"}));
    assert_eq!(lines[2], json!({"result": 1}));
}

#[test]
fn structural_errors_are_reported_per_request() {
    let service = Service::new(DispatchTable::with_builtins());
    let lines = run(
        &service,
        &[
            r#"{"command_name": "echo"}"#,
            r#"{"arguments": {}}"#,
            r#"{"command_name": 5, "arguments": {}}"#,
            r#"{"command_name": "", "arguments": {}}"#,
            r#"["echo", {}]"#,
        ],
    );
    assert_eq!(lines.len(), 5);
    for line in &lines {
        let message = line["error"].as_str().expect("error response");
        assert!(message.starts_with("invalid request:"), "{message}");
        assert!(line.get("result").is_none());
    }
}

#[test]
fn custom_commands_share_the_table() {
    let mut builder = DispatchTable::builder();
    builder
        .register("shout", "Upper-case the `text` argument", |args| {
            Ok(Value::String(required_str(args, "text")?.to_uppercase()))
        })
        .unwrap()
        .register("fail", "Always fails", |_| {
            Err(CommandError::Failed("disk on fire".into()))
        })
        .unwrap();
    let service = Service::new(builder.build());

    let lines = run(
        &service,
        &[
            r#"{"command_id": 1, "command_name": "shout", "arguments": {"text": "hey"}}"#,
            r#"{"command_id": 2, "command_name": "fail", "arguments": {}}"#,
            r#"{"command_id": 3, "command_name": "echo", "arguments": {"msg": "x"}}"#,
            r#"{"command_id": 4, "command_name": "describe", "arguments": {"command": "shout"}}"#,
        ],
    );

    assert_eq!(lines[0], json!({"command_id": 1, "result": "HEY"}));
    assert_eq!(lines[1], json!({"command_id": 2, "error": "fail: disk on fire"}));
    // Built-ins are opt-in.
    assert_eq!(lines[2], json!({"command_id": 3, "error": "unknown command: echo"}));
    assert_eq!(
        lines[3],
        json!({"command_id": 4, "result": "Upper-case the `text` argument"})
    );
}

#[test]
fn panicking_command_is_reported() {
    let mut builder = DispatchTable::builder();
    builder
        .register("explode", "Panics", |_| panic!("kaboom"))
        .unwrap();
    let service = Service::new(builder.build());

    let lines = run(
        &service,
        &[
            r#"{"command_name": "explode", "arguments": {}}"#,
            r#"{"command_name": "help", "arguments": {}}"#,
        ],
    );
    assert_eq!(lines[0], json!({"error": "explode: command panicked"}));
    assert!(lines[1]["result"]["commands"].is_array());
}

struct SharedWriter(Rc<RefCell<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
