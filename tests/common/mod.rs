#![allow(dead_code)]

use anyhow::{Context, anyhow};
use playdap::adapter::Session;
use playdap::adapter::session::SessionOptions;
use playdap::dap::transport;
use playdap::debuggee::addr::SocketAddress;
use playdap::debuggee::socket::{self, DebuggeeListener, RawStream};
use playdap::debuggee::wire::{self, AdapterMessage, DebuggeeMessage, PositionInfo, TaskInfo};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DapClient {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
    next_seq: i64,
    pending: VecDeque<Value>,
}

impl DapClient {
    fn new(stream: UnixStream) -> anyhow::Result<Self> {
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("set DAP read timeout")?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            next_seq: 1,
            pending: VecDeque::new(),
        })
    }

    pub fn send_request(&mut self, command: &str, arguments: Value) -> anyhow::Result<i64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.write_message(&request)?;
        Ok(seq)
    }

    /// Answer a reverse request of the adapter.
    pub fn send_response(
        &mut self,
        request: &Value,
        success: bool,
        message: Option<&str>,
        body: Value,
    ) -> anyhow::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut response = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": success,
            "body": body,
        });
        if let Some(message) = message {
            response["message"] = json!(message);
        }
        self.write_message(&response)
    }

    /// Send a request and wait for its response.
    pub fn request(&mut self, command: &str, arguments: Value) -> anyhow::Result<Value> {
        let seq = self.send_request(command, arguments)?;
        self.read_response(seq)
    }

    /// First message matching `pred`, other messages stay queued.
    fn next_matching(&mut self, pred: impl Fn(&Value) -> bool) -> anyhow::Result<Value> {
        if let Some(idx) = self.pending.iter().position(&pred) {
            return Ok(self.pending.remove(idx).unwrap());
        }
        loop {
            let msg = self.read_message()?;
            if pred(&msg) {
                return Ok(msg);
            }
            self.pending.push_back(msg);
        }
    }

    pub fn read_response(&mut self, request_seq: i64) -> anyhow::Result<Value> {
        self.next_matching(|msg| {
            msg["type"] == json!("response") && msg["request_seq"] == json!(request_seq)
        })
    }

    pub fn wait_for_event(&mut self, name: &str) -> anyhow::Result<Value> {
        self.next_matching(|msg| msg["type"] == json!("event") && msg["event"] == json!(name))
    }

    pub fn wait_for_reverse_request(&mut self, command: &str) -> anyhow::Result<Value> {
        self.next_matching(|msg| msg["type"] == json!("request") && msg["command"] == json!(command))
    }

    /// Events with `name` received so far, without waiting.
    pub fn take_events(&mut self, name: &str) -> Vec<Value> {
        let (matched, rest): (Vec<Value>, Vec<Value>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|msg| msg["type"] == json!("event") && msg["event"] == json!(name));
        self.pending = rest.into();
        matched
    }

    fn read_message(&mut self) -> anyhow::Result<Value> {
        let deadline = Instant::now() + MESSAGE_TIMEOUT;
        let mut content_length = None;
        loop {
            let mut line = String::new();
            let read_n = loop {
                match self.reader.read_line(&mut line) {
                    Ok(n) => break n,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        if Instant::now() > deadline {
                            return Err(anyhow!("Timed out waiting for DAP header"));
                        }
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if read_n == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse::<usize>()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(serde_json::from_slice(&buf)?)
    }

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        write!(self.stream, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Adapter session running in a thread, connected to a test client.
pub struct DapSession {
    pub client: DapClient,
    handle: Option<JoinHandle<()>>,
}

impl DapSession {
    pub fn start() -> anyhow::Result<Self> {
        Self::start_with(SessionOptions::default())
    }

    pub fn start_with(options: SessionOptions) -> anyhow::Result<Self> {
        let (ours, theirs) = UnixStream::pair().context("socket pair")?;
        let (reader, writer) = transport::unix(theirs, false)?;
        let handle = thread::spawn(move || Session::run(reader, writer, options));
        Ok(Self {
            client: DapClient::new(ours)?,
            handle: Some(handle),
        })
    }

    pub fn initialize(&mut self) -> anyhow::Result<Value> {
        let response = self.client.request(
            "initialize",
            json!({"adapterID": "playdap", "supportsRunInTerminalRequest": true}),
        )?;
        assert_response(&response, "initialize", true);
        Ok(response)
    }

    /// Attach to a debuggee listening on `address` and accept it on `listener`.
    pub fn attach(&mut self, listener: &DebuggeeListener) -> anyhow::Result<FakeDebuggee> {
        let seq = self.client.send_request(
            "attach",
            json!({"address": listener.address().to_string()}),
        )?;
        let debuggee = FakeDebuggee::accept(listener)?;
        let response = self.client.read_response(seq)?;
        assert_response(&response, "attach", true);
        self.client.wait_for_event("initialized")?;
        Ok(debuggee)
    }

    pub fn disconnect(&mut self) -> anyhow::Result<Value> {
        let response = self.client.request("disconnect", json!({}))?;
        assert_response(&response, "disconnect", true);
        Ok(response)
    }

    /// Wait for the session loop to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

pub fn assert_response(response: &Value, command: &str, success: bool) {
    assert_eq!(response["type"], json!("response"), "{response}");
    assert_eq!(response["command"], json!(command), "{response}");
    assert_eq!(response["success"], json!(success), "{response}");
    assert!(response["seq"].as_i64().is_some());
}

pub fn error_message(response: &Value) -> String {
    response["message"].as_str().unwrap_or_default().to_string()
}

/// Debuggee side of the adapter connection, speaks the wire protocol directly.
pub struct FakeDebuggee {
    stream: RawStream,
}

impl FakeDebuggee {
    pub fn listener() -> anyhow::Result<DebuggeeListener> {
        let addr = SocketAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        Ok(DebuggeeListener::bind(&addr)?)
    }

    pub fn accept(listener: &DebuggeeListener) -> anyhow::Result<Self> {
        let stream = listener.accept(CONNECT_TIMEOUT)?;
        Self::new(stream)
    }

    /// Connect to the adapter, retrying until it listens.
    pub fn connect(address: &str) -> anyhow::Result<Self> {
        let addr: SocketAddress = address.parse()?;
        let start = Instant::now();
        loop {
            match socket::connect(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Self::new(stream),
                Err(err) if start.elapsed() > CONNECT_TIMEOUT => {
                    return Err(anyhow!("connect to {address}: {err}"));
                }
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
    }

    fn new(stream: RawStream) -> anyhow::Result<Self> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(Self { stream })
    }

    pub fn send(&mut self, message: DebuggeeMessage) -> anyhow::Result<()> {
        wire::write_frame(&mut self.stream, &message)?;
        Ok(())
    }

    /// Next message from the adapter, `None` when the adapter closed the connection.
    pub fn recv(&mut self) -> anyhow::Result<Option<AdapterMessage>> {
        Ok(wire::read_frame(&mut self.stream)?)
    }

    pub fn expect(&mut self) -> anyhow::Result<AdapterMessage> {
        self.recv()?
            .ok_or_else(|| anyhow!("adapter closed the debuggee connection"))
    }

    /// Skip messages until one matches `pred`.
    pub fn expect_matching(
        &mut self,
        pred: impl Fn(&AdapterMessage) -> bool,
    ) -> anyhow::Result<AdapterMessage> {
        loop {
            let msg = self.expect()?;
            if pred(&msg) {
                return Ok(msg);
            }
        }
    }

    pub fn close(self) {
        let _ = self.stream.shutdown();
    }

    pub fn discover(&mut self, file: &str, lines: &[(i64, &str)]) -> anyhow::Result<()> {
        self.send(DebuggeeMessage::TasksDiscovered {
            file: file.to_string(),
            positions: lines
                .iter()
                .map(|(line, task_id)| PositionInfo {
                    line: *line,
                    task_id: task_id.to_string(),
                    breakable: true,
                })
                .collect(),
        })
    }

    pub fn task_start(&mut self, host: &str, task: TaskInfo) -> anyhow::Result<()> {
        self.send(DebuggeeMessage::TaskStart {
            host: host.to_string(),
            task,
            parent: None,
        })
    }
}

pub fn task(task_id: &str, name: &str, file: &str, line: i64) -> TaskInfo {
    TaskInfo {
        task_id: task_id.to_string(),
        name: name.to_string(),
        file: Some(file.to_string()),
        line: Some(line),
        is_include: false,
    }
}
