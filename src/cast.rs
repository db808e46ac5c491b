//! Source client for Icecast-style servers: an HTTP `PUT` handshake on a
//! raw socket, then a writer thread streaming the engine's bytes.

use crate::audio_runtime::{Chunk, SessionRegistry};
use crate::engine::{CastParams, Encoder, EncoderSettings};
use crate::error::{CastError, Result};
use crate::http;
use crate::logging::LogContext;
use crossbeam_channel::Receiver;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_RESPONSE: usize = 8 * 1024;

/// Build the source request sent on connect.
pub fn source_request(params: &CastParams, settings: &EncoderSettings) -> String {
    let mut req = String::new();
    req.push_str(&format!("PUT {} HTTP/1.1\r\n", params.mount));
    req.push_str(&format!("Host: {}:{}\r\n", params.host, params.port));
    req.push_str(&format!(
        "Authorization: {}\r\n",
        http::basic_auth(&params.username, &params.password)
    ));
    req.push_str(&format!("User-Agent: onair/{}\r\n", env!("CARGO_PKG_VERSION")));
    req.push_str(&format!("Content-Type: {}\r\n", params.content_type));
    req.push_str(&format!("ice-name: {}\r\n", params.name));
    req.push_str(&format!("ice-genre: {}\r\n", params.genre));
    req.push_str(&format!("ice-description: {}\r\n", params.description));
    req.push_str(&format!("ice-public: {}\r\n", u8::from(params.public)));
    req.push_str(&format!("ice-bitrate: {}\r\n", params.bitrate_kbps));
    req.push_str(&format!(
        "ice-audio-info: bitrate={};mode={}\r\n",
        params.bitrate_kbps, settings.bitrate_mode
    ));
    req.push_str("Expect: 100-continue\r\n\r\n");
    req
}

/// Interpret the server's answer to the source request.
pub fn classify_response(response: &str) -> std::result::Result<(), CastError> {
    let status_line = response.lines().next().unwrap_or("").trim();
    let code: Option<u16> = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok());
    match code {
        Some(c) if (100..300).contains(&c) => Ok(()),
        Some(403) if response.to_lowercase().contains("in use") => Err(CastError::Busy),
        Some(_) => Err(CastError::Failed(format!("server answered '{}'", status_line))),
        None => Err(CastError::Failed("no HTTP status from server".to_string())),
    }
}

fn read_response(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    while buf.len() < MAX_RESPONSE {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).to_string())
}

fn read_body(stream: &mut TcpStream) -> String {
    let _ = stream.set_read_timeout(Some(BODY_TIMEOUT));
    let mut buf = Vec::new();
    let _ = stream.take(MAX_RESPONSE as u64).read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

fn open_source(params: &CastParams, settings: &EncoderSettings) -> std::result::Result<TcpStream, CastError> {
    let failed = |what: &str, e: std::io::Error| CastError::Failed(format!("{}: {}", what, e));

    let addr = (params.host.as_str(), params.port)
        .to_socket_addrs()
        .map_err(|e| failed("resolve", e))?
        .next()
        .ok_or_else(|| CastError::Failed(format!("no address for {}", params.host)))?;

    let mut stream =
        TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| failed("connect", e))?;
    stream
        .set_read_timeout(Some(CONNECT_TIMEOUT))
        .map_err(|e| failed("socket", e))?;
    stream
        .write_all(source_request(params, settings).as_bytes())
        .map_err(|e| failed("send request", e))?;

    let mut response = read_response(&mut stream).map_err(|e| failed("read response", e))?;
    if classify_response(&response).is_err() {
        // Error details ("Mountpoint in use") usually sit in the body.
        response.push_str(&read_body(&mut stream));
    }
    classify_response(&response)?;

    stream
        .set_read_timeout(None)
        .and_then(|_| stream.set_write_timeout(Some(WRITE_TIMEOUT)))
        .map_err(|e| failed("socket", e))?;
    Ok(stream)
}

fn writer_loop(mut stream: TcpStream, rx: Receiver<Chunk>, alive: &AtomicBool, log: &LogContext) {
    while let Ok(chunk) = rx.recv() {
        if let Err(e) = stream.write_all(&chunk) {
            log.warn(format!("Stream write failed: {}", e));
            break;
        }
    }
    alive.store(false, Ordering::SeqCst);
}

struct CastSession {
    id: u64,
    params: CastParams,
    socket: TcpStream,
    alive: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
}

/// Encoder that forwards the engine's bytes unchanged.
pub struct PassthroughEncoder {
    settings: EncoderSettings,
    sessions: Arc<SessionRegistry>,
    session: Option<CastSession>,
    agent: ureq::Agent,
    log: LogContext,
}

impl PassthroughEncoder {
    pub fn new(settings: EncoderSettings, sessions: Arc<SessionRegistry>, log: &LogContext) -> Self {
        PassthroughEncoder {
            settings,
            sessions,
            session: None,
            agent: http::agent(http::HTTP_TIMEOUT),
            log: log.for_component("cast"),
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }
}

impl Encoder for PassthroughEncoder {
    fn cast_init(&mut self, params: &CastParams) -> std::result::Result<(), CastError> {
        if self.is_casting() {
            return Err(CastError::Busy);
        }
        // A dead session still holds a socket and a registry slot.
        self.close();

        let stream = open_source(params, &self.settings)?;
        let socket = stream
            .try_clone()
            .map_err(|e| CastError::Failed(format!("socket: {}", e)))?;

        let (id, rx) = self.sessions.register();
        let alive = Arc::new(AtomicBool::new(true));
        let writer_alive = alive.clone();
        let writer_log = self.log.clone();
        let writer = std::thread::Builder::new()
            .name(format!("cast-writer{}", params.mount.replace('/', "-")))
            .spawn(move || writer_loop(stream, rx, &writer_alive, &writer_log));
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                self.sessions.remove(id);
                let _ = socket.shutdown(Shutdown::Both);
                return Err(CastError::Failed(format!("spawn writer: {}", e)));
            }
        };

        self.log.info(format!("Casting to {}", params.url()));
        self.session = Some(CastSession {
            id,
            params: params.clone(),
            socket,
            alive,
            writer: Some(writer),
        });
        Ok(())
    }

    fn set_metadata(&mut self, artist: &str, title: &str) -> Result<()> {
        let Some(session) = &self.session else {
            return Err(CastError::Failed("not casting".to_string()).into());
        };
        let p = &session.params;
        let url = format!("http://{}:{}/admin/metadata", p.host, p.port);
        let song = format!("{} - {}", artist, title);
        self.agent
            .get(&url)
            .query("mount", &p.mount)
            .query("mode", "updinfo")
            .query("song", &song)
            .header("Authorization", &http::basic_auth(&p.username, &p.password))
            .call()?;
        self.log.debug(format!("Metadata on {}: {}", p.mount, song));
        Ok(())
    }

    fn is_casting(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.alive.load(Ordering::SeqCst))
    }

    fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.sessions.remove(session.id);
        let _ = session.socket.shutdown(Shutdown::Both);
        if let Some(writer) = session.writer.take() {
            let _ = writer.join();
        }
        self.log
            .debug(format!("Cast session closed: {}", session.params.url()));
    }
}

impl Drop for PassthroughEncoder {
    fn drop(&mut self) {
        self.close();
    }
}
