//! Loopback HTTP servers for tests: a bare request/reply server and a fake DKN Cloud built on it.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::models::dkn::Installation;

const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: String,
}

pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    pub fn text(body: impl Into<String>) -> Self {
        Reply {
            status: 200,
            content_type: "text/plain; charset=UTF-8",
            body: body.into(),
        }
    }

    pub fn json(body: impl Into<String>) -> Self {
        Reply {
            status: 200,
            content_type: "application/json",
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Reply {
            status: 404,
            content_type: "text/plain",
            body: "not found".to_string(),
        }
    }
}

/// Serve every connection on its own thread, one request per connection.
/// Returns the base URL with a trailing slash.
pub fn serve<F>(handler: F) -> String
where
    F: Fn(&Request) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let port = listener.local_addr().expect("local addr").port();
    let handler = Arc::new(handler);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let handler = Arc::clone(&handler);
            thread::spawn(move || {
                let _ = answer(stream, handler.as_ref());
            });
        }
    });
    format!("http://127.0.0.1:{port}/")
}

fn answer<F>(stream: TcpStream, handler: &F) -> std::io::Result<()>
where
    F: Fn(&Request) -> Reply,
{
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut chunked = false;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.parse().unwrap_or(0),
                "transfer-encoding" => chunked = value.eq_ignore_ascii_case("chunked"),
                _ => {}
            }
        }
    }

    let body = if chunked {
        read_chunked(&mut reader)?
    } else {
        let mut buf = vec![0; content_length];
        reader.read_exact(&mut buf)?;
        buf
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target, HashMap::new()),
    };
    let request = Request {
        method,
        path,
        query,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let reply = handler(&request);

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reply.content_type,
        reply.body.len(),
        reply.body
    )?;
    stream.flush()
}

fn read_chunked(reader: &mut impl BufRead) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let mut size = String::new();
        reader.read_line(&mut size)?;
        let size = usize::from_str_radix(size.trim().split(';').next().unwrap_or("0"), 16).unwrap_or(0);
        if size == 0 {
            let mut trailer = String::new();
            reader.read_line(&mut trailer)?;
            return Ok(body);
        }
        let mut chunk = vec![0; size + 2];
        reader.read_exact(&mut chunk)?;
        chunk.truncate(size);
        body.extend(chunk);
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =====================
// Fake DKN Cloud
// =====================

#[derive(Default)]
struct CloudState {
    next_sid: AtomicU64,
    /// Outgoing packets per engine session.
    queues: Mutex<HashMap<String, Vec<String>>>,
    /// Namespaces in the order the client joined them.
    joins: Mutex<Vec<String>>,
    hang_up: AtomicBool,
}

/// Serves login, the installation listing and the realtime socket from the JSON fixtures.
/// Every device of a joined installation namespace reports `device-data` right after the
/// join, except the MACs listed as silent.
pub struct FakeCloud {
    pub url: String,
    state: Arc<CloudState>,
}

impl FakeCloud {
    pub fn start(silent: &[&str]) -> Self {
        let listing: Vec<Installation> =
            serde_json::from_str(&fixture("installations.json")).expect("parse installations");
        let device_data: Value = serde_json::from_str(&fixture("device-data.json")).expect("parse device data");
        let data = device_data["data"].clone();
        let silent: Vec<String> = silent.iter().map(|s| s.to_string()).collect();
        let state = Arc::new(CloudState::default());

        let shared = Arc::clone(&state);
        let url = serve(move |req| {
            match (req.method.as_str(), req.path.as_str()) {
                ("POST", "/api/v1/auth/login/dknUsa") => Reply::json(fixture("login.json")),
                ("GET", "/api/v1/installations/dknUsa") => Reply::json(fixture("installations.json")),
                (method, "/api/v1/devices/socket.io/") => match (method, req.query.get("sid")) {
                    ("GET", None) => {
                        let sid = format!("sid-{}", shared.next_sid.fetch_add(1, Ordering::SeqCst));
                        shared.queues.lock().unwrap().insert(sid.clone(), Vec::new());
                        Reply::text(format!(r#"0{{"sid":"{sid}","pingInterval":25000,"pingTimeout":20000}}"#))
                    }
                    ("GET", Some(sid)) => {
                        if shared.hang_up.load(Ordering::SeqCst) {
                            return Reply::text("1");
                        }
                        let pending = shared
                            .queues
                            .lock()
                            .unwrap()
                            .get_mut(sid)
                            .map(std::mem::take)
                            .unwrap_or_default();
                        if pending.is_empty() {
                            thread::sleep(IDLE_POLL);
                            Reply::text("6")
                        } else {
                            Reply::text(pending.join("\u{1e}"))
                        }
                    }
                    ("POST", Some(sid)) => {
                        for packet in req.body.split('\u{1e}') {
                            let Some(namespace) = packet.strip_prefix("40").and_then(|p| p.strip_suffix(',')) else {
                                continue;
                            };
                            shared.joins.lock().unwrap().push(namespace.to_string());
                            let mut out = vec![format!(r#"40{namespace},{{"sid":"sock-{sid}"}}"#)];
                            let devices = listing
                                .iter()
                                .filter(|inst| format!("/{}::dknUsa", inst.id.0) == namespace)
                                .flat_map(|inst| inst.devices.iter());
                            for device in devices.filter(|d| !silent.contains(&d.mac.0)) {
                                let event = json!(["device-data", {"mac": device.mac.0, "data": data}]);
                                out.push(format!("42{namespace},{event}"));
                            }
                            if let Some(queue) = shared.queues.lock().unwrap().get_mut(sid) {
                                queue.extend(out);
                            }
                        }
                        Reply::text("ok")
                    }
                    _ => Reply::not_found(),
                },
                _ => Reply::not_found(),
            }
        });
        FakeCloud { url, state }
    }

    /// Namespaces joined so far, in order.
    pub fn joins(&self) -> Vec<String> {
        self.state.joins.lock().unwrap().clone()
    }

    /// Close every engine session on its next poll.
    pub fn hang_up(&self) {
        self.state.hang_up.store(true, Ordering::SeqCst);
    }
}

pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(format!("tests/data/{name}")).expect("fixture present")
}
