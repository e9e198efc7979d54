// Peer HTTP endpoint: client side (fetch a peer's sensor value) and provider side (serve our own).
// Route: GET {prefix}/devices/{deviceId}/{sensorId} -> {"value": ...} or the literal `null`.

use crate::node::config::HttpConfig;
use crate::node::readings::ReadingCache;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Line a provider sends when it has no value for the sensor.
pub const NULL_SENTINEL: &str = "null";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer answered with status {0}")]
    Status(u16),
    #[error("unreadable peer response: {0}")]
    Body(String),
}

/// Client side of the peer endpoint.
pub trait ServiceFetcher: Send + Sync {
    /// Best-effort request that makes the peer expose the device page.
    fn enable_device_page(&self, peer_ip: &str, device_id: &str, sensor_id: &str) -> Result<(), FetchError>;
    /// Current value of a peer's sensor; `None` when the peer has nothing to report.
    fn fetch_sensor_value(
        &self,
        peer_ip: &str,
        device_id: &str,
        sensor_id: &str,
    ) -> Result<Option<String>, FetchError>;
}

pub struct HttpServiceFetcher {
    client: Client,
    port: u16,
    path_prefix: String,
}

impl HttpServiceFetcher {
    pub fn new(cfg: &HttpConfig) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(cfg.timeout()).build()?;
        Ok(Self {
            client,
            port: cfg.port,
            path_prefix: cfg.path_prefix.trim_end_matches('/').to_string(),
        })
    }

    /// `peer_ip` may carry its own port (`host:port`); otherwise the configured one is used.
    /// IPv6 hosts are bracketed.
    pub fn device_url(&self, peer_ip: &str, device_id: &str, sensor_id: &str) -> String {
        let authority = if let Ok(addr) = peer_ip.parse::<SocketAddr>() {
            addr.to_string()
        } else {
            let host = peer_ip.trim_start_matches('[').trim_end_matches(']');
            match host.parse::<IpAddr>() {
                Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
                Err(_) => format!("{}:{}", peer_ip, self.port),
            }
        };
        format!(
            "http://{}{}/devices/{}/{}",
            authority, self.path_prefix, device_id, sensor_id
        )
    }
}

impl ServiceFetcher for HttpServiceFetcher {
    fn enable_device_page(&self, peer_ip: &str, device_id: &str, sensor_id: &str) -> Result<(), FetchError> {
        let url = self.device_url(peer_ip, device_id, sensor_id);
        let status = self.client.get(&url).send()?.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn fetch_sensor_value(
        &self,
        peer_ip: &str,
        device_id: &str,
        sensor_id: &str,
    ) -> Result<Option<String>, FetchError> {
        let url = self.device_url(peer_ip, device_id, sensor_id);
        let response = self.client.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        parse_sensor_body(&response.text()?)
    }
}

/// Any `null` line means no value; otherwise the last line must be JSON with a non-null `value`.
pub fn parse_sensor_body(body: &str) -> Result<Option<String>, FetchError> {
    let mut last = None;
    for line in body.lines() {
        if line.trim() == NULL_SENTINEL {
            return Ok(None);
        }
        last = Some(line);
    }
    let Some(line) = last else {
        return Err(FetchError::Body("empty body".into()));
    };
    let parsed: Value = serde_json::from_str(line).map_err(|e| FetchError::Body(e.to_string()))?;
    Ok(match parsed.get("value") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    })
}

/// Provider side: serves cached readings of this node's devices.
pub struct ReadingServer {
    addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ReadingServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the accept loop.
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_millis(200));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReadingServer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

pub fn start_reading_server(
    listen_addr: &str,
    readings: Arc<ReadingCache>,
    path_prefix: &str,
) -> std::io::Result<ReadingServer> {
    let listener = TcpListener::bind(listen_addr)?;
    let addr = listener.local_addr()?;
    let stopping = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stopping);
    let prefix = path_prefix.trim_end_matches('/').to_string();
    info!(%addr, prefix = %prefix, "reading server listening");

    let handle = thread::spawn(move || {
        for stream in listener.incoming() {
            if stop_flag.load(Ordering::SeqCst) {
                break;
            }
            if let Ok(stream) = stream {
                let readings = Arc::clone(&readings);
                let prefix = prefix.clone();
                thread::spawn(move || handle_client(stream, &readings, &prefix));
            }
        }
        debug!("reading server stopped");
    });

    Ok(ReadingServer {
        addr,
        stopping,
        handle: Some(handle),
    })
}

fn handle_client(mut stream: TcpStream, readings: &ReadingCache, prefix: &str) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let req = match read_request(&mut stream) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "bad http request");
            return;
        }
    };
    if req.method != "GET" {
        return write_response(&mut stream, 404, r#"{"error":"not found"}"#);
    }
    let Some((device_id, sensor_id)) = device_route(&req.path, prefix) else {
        return write_response(&mut stream, 404, r#"{"error":"not found"}"#);
    };
    match readings.latest(device_id, sensor_id) {
        Some(value) => {
            let body = json!({ "value": value }).to_string();
            write_response(&mut stream, 200, &body);
        }
        None => write_response(&mut stream, 200, NULL_SENTINEL),
    }
}

fn device_route<'a>(path: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let path = path.split('?').next().unwrap_or(path);
    let rest = path.strip_prefix(prefix)?.strip_prefix("/devices/")?;
    let (device, sensor) = rest.split_once('/')?;
    if device.is_empty() || sensor.is_empty() || sensor.contains('/') {
        return None;
    }
    Some((device, sensor))
}

struct Request {
    method: String,
    path: String,
}

fn read_request(stream: &mut TcpStream) -> Result<Request, String> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf).map_err(|e| format!("{}", e))?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|w| w == b"\r\n\r\n") || data.len() > 64 * 1024 {
            break;
        }
    }
    let req_str = String::from_utf8_lossy(&data);
    let line = req_str.split("\r\n").next().ok_or("bad request")?;
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or("bad method")?.to_string();
    let path = parts.next().ok_or("bad path")?.to_string();
    Ok(Request { method, path })
}

fn write_response(stream: &mut TcpStream, status: u16, body: &str) {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let resp = format!(
        "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
    );
    if let Err(e) = stream.write_all(resp.as_bytes()) {
        warn!(error = %e, "failed to write http response");
    }
}
