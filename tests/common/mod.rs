#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use usage_beacon::upload::transport::{Transport, TransportError, UploadRequest};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_beacon") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "beacon.exe" } else { "beacon" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve beacon binary path for integration test"),
    }
}

/// Run the CLI against an isolated data directory and log the exchange.
///
/// `HOME` points into `data_dir` so the default config path never exists and
/// defaults apply unless `env` overrides them.
pub fn run_cli_case(
    case_name: &str,
    data_dir: &Path,
    args: &[&str],
    env: &[(&str, &str)],
) -> CmdResult {
    let root = std::env::temp_dir().join("umb-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env("HOME", data_dir)
        .env("UMB_DATA_DIR", data_dir.join("data"))
        .env_remove("UMB_UPLOAD_ENDPOINT")
        .env_remove("UMB_UPLOAD_API_KEY")
        .env("RUST_BACKTRACE", "1");
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command.output().expect("execute beacon command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Parse the single JSON line a `--json` command prints.
pub fn json_output(result: &CmdResult) -> serde_json::Value {
    let line = result
        .stdout
        .lines()
        .find(|l| l.trim_start().starts_with('{'))
        .unwrap_or_else(|| panic!("no JSON in stdout; see {}", result.log_path.display()));
    serde_json::from_str(line).expect("stdout line is JSON")
}

// ──────────────────── in-process transport ────────────────────

/// Request seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub url: String,
    pub api_key: String,
    pub idempotency_key: String,
    pub body: String,
}

/// Answers with queued statuses in order, then 200.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<u16, TransportError>>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedTransport {
    pub fn statuses(statuses: &[u16]) -> Self {
        Self {
            script: Mutex::new(statuses.iter().map(|s| Ok(*s)).collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn post(&self, request: &UploadRequest<'_>) -> Result<u16, TransportError> {
        self.seen.lock().push(SeenRequest {
            url: request.url.to_string(),
            api_key: request.api_key.to_string(),
            idempotency_key: request.idempotency_key.to_string(),
            body: request.body.to_string(),
        });
        self.script.lock().pop_front().unwrap_or(Ok(200))
    }
}

// ──────────────────── loopback HTTP collector ────────────────────

/// Minimal HTTP/1.1 collector on 127.0.0.1 answering scripted statuses.
pub struct StubCollector {
    pub url: String,
    bodies: Arc<Mutex<Vec<(String, String)>>>,
}

impl StubCollector {
    /// Serve `statuses` in order, then 200 for every further request.
    pub fn start(statuses: &[u16]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let url = format!(
            "http://{}/v1/usage",
            listener.local_addr().expect("local addr")
        );
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let script: Arc<Mutex<VecDeque<u16>>> =
            Arc::new(Mutex::new(statuses.iter().copied().collect()));

        let seen = Arc::clone(&bodies);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let status = script.lock().pop_front().unwrap_or(200);
                if let Some(request) = serve_one(stream, status) {
                    seen.lock().push(request);
                }
            }
        });

        Self { url, bodies }
    }

    /// `(api key header, body)` for each request received so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.bodies.lock().clone()
    }
}

fn serve_one(mut stream: TcpStream, status: u16) -> Option<(String, String)> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut content_length = 0usize;
    let mut api_key = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            if name == "content-length" {
                content_length = value.trim().parse().unwrap_or(0);
            } else if name == "x-api-key" {
                api_key = value.trim().to_string();
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok()?;

    let response =
        format!("HTTP/1.1 {status} Scripted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).ok()?;
    stream.flush().ok()?;
    Some((api_key, String::from_utf8_lossy(&body).to_string()))
}
