//! Tor control-port client for circuit rotation
//!
//! Speaks the small slice of the textual control protocol this crate
//! needs: AUTHENTICATE (password, cookie, or open), SIGNAL NEWNYM,
//! GETINFO circuit-status / ns/id / ip-to-country, and QUIT. One
//! connection per controller; rotation serializes on the session mutex so
//! overlapping NEWNYM signals cannot race the settle delay.

use parking_lot::Mutex as SyncMutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Control channel configuration
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Control port on localhost
    pub port: u16,
    /// Password authentication, if configured
    pub password: Option<String>,
    /// Cookie file authentication, if configured
    pub cookie_path: Option<PathBuf>,
    /// Pause after NEWNYM so requests don't race an unbuilt circuit
    pub settle: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: 9051,
            password: None,
            cookie_path: None,
            settle: Duration::from_secs(2),
        }
    }
}

/// Errors on the control channel
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),
}

/// Exit relay metadata from the last hop of a built circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitIdentity {
    pub fingerprint: String,
    pub nickname: Option<String>,
    pub address: Option<String>,
    pub country: Option<String>,
}

/// One relay hop in a circuit path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitHop {
    pub fingerprint: String,
    pub nickname: Option<String>,
}

/// A circuit as reported by `GETINFO circuit-status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitInfo {
    pub id: String,
    pub built: bool,
    pub path: Vec<CircuitHop>,
}

/// A parsed control-protocol reply
#[derive(Debug)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn is_ok(&self) -> bool {
        self.code == 250
    }
}

struct ControlStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlStream {
    async fn open(port: u16) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send one command and read the full reply, including data blocks
    async fn command(&mut self, cmd: &str) -> Result<Reply, ControlError> {
        self.writer.write_all(cmd.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let mut code = 0u16;
        let mut lines = Vec::new();

        loop {
            let mut raw = String::new();
            let n = self.reader.read_line(&mut raw).await?;
            if n == 0 {
                return Err(ControlError::Protocol("connection closed mid-reply".into()));
            }
            let line = raw.trim_end_matches(['\r', '\n']);
            if line.len() < 4 || !line.is_char_boundary(3) {
                return Err(ControlError::Protocol(format!("short reply line: {:?}", line)));
            }

            let (status, rest) = line.split_at(3);
            let parsed: u16 = status
                .parse()
                .map_err(|_| ControlError::Protocol(format!("bad status: {:?}", line)))?;
            let sep = rest.as_bytes()[0];
            let text = &rest[1..];

            match sep {
                b'-' => lines.push(text.to_string()),
                b'+' => {
                    lines.push(text.to_string());
                    loop {
                        let mut data = String::new();
                        let n = self.reader.read_line(&mut data).await?;
                        if n == 0 {
                            return Err(ControlError::Protocol(
                                "connection closed in data block".into(),
                            ));
                        }
                        let data = data.trim_end_matches(['\r', '\n']);
                        if data == "." {
                            break;
                        }
                        lines.push(data.to_string());
                    }
                }
                b' ' => {
                    code = parsed;
                    lines.push(text.to_string());
                    break;
                }
                _ => {
                    return Err(ControlError::Protocol(format!("bad separator: {:?}", line)));
                }
            }
        }

        Ok(Reply { code, lines })
    }
}

/// Controller for one Tor instance's control port
pub struct CircuitController {
    config: ControlConfig,
    session: Mutex<Option<ControlStream>>,
    rotation_count: AtomicU64,
    last_rotation: SyncMutex<Option<Instant>>,
}

impl CircuitController {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            rotation_count: AtomicU64::new(0),
            last_rotation: SyncMutex::new(None),
        }
    }

    /// Connect and authenticate. Failure is non-fatal: the controller
    /// stays disconnected and rotation requests become no-ops.
    pub async fn connect(&self) -> bool {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return true;
        }

        let mut stream = match ControlStream::open(self.config.port).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to reach control port {}: {}", self.config.port, e);
                return false;
            }
        };

        let auth = match self.auth_command().await {
            Ok(cmd) => cmd,
            Err(e) => {
                error!("Cannot build AUTHENTICATE command: {}", e);
                return false;
            }
        };

        match stream.command(&auth).await {
            Ok(reply) if reply.is_ok() => {
                info!("Connected to control port {}", self.config.port);
                *session = Some(stream);
                true
            }
            Ok(reply) => {
                error!(
                    "Control port {} rejected authentication ({})",
                    self.config.port, reply.code
                );
                false
            }
            Err(e) => {
                error!("Control port {} handshake failed: {}", self.config.port, e);
                false
            }
        }
    }

    async fn auth_command(&self) -> Result<String, ControlError> {
        if let Some(password) = &self.config.password {
            let escaped = password.replace('\\', "\\\\").replace('"', "\\\"");
            return Ok(format!("AUTHENTICATE \"{}\"", escaped));
        }
        if let Some(path) = &self.config.cookie_path {
            let cookie = tokio::fs::read(path).await?;
            let hex: String = cookie.iter().map(|b| format!("{:02x}", b)).collect();
            return Ok(format!("AUTHENTICATE {}", hex));
        }
        Ok("AUTHENTICATE".to_string())
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Request a fresh identity via NEWNYM. Holds the session for the
    /// settle interval so a second caller cannot signal mid-rebuild.
    pub async fn rotate_circuit(&self) -> bool {
        let mut session = self.session.lock().await;
        let Some(stream) = session.as_mut() else {
            warn!("Cannot rotate circuit: controller not connected");
            return false;
        };

        match stream.command("SIGNAL NEWNYM").await {
            Ok(reply) if reply.is_ok() => {
                let count = self.rotation_count.fetch_add(1, Ordering::SeqCst) + 1;
                *self.last_rotation.lock() = Some(Instant::now());
                info!("Circuit rotated (rotation #{})", count);
                tokio::time::sleep(self.config.settle).await;
                true
            }
            Ok(reply) => {
                error!("NEWNYM rejected with status {}", reply.code);
                false
            }
            Err(e) => {
                error!("Failed to rotate circuit: {}", e);
                *session = None;
                false
            }
        }
    }

    /// Currently built circuits
    pub async fn circuits(&self) -> Vec<CircuitInfo> {
        let mut session = self.session.lock().await;
        let Some(stream) = session.as_mut() else {
            return Vec::new();
        };

        match stream.command("GETINFO circuit-status").await {
            Ok(reply) if reply.is_ok() => {
                let body = getinfo_value(&reply.lines, "circuit-status").unwrap_or_default();
                parse_circuit_status(&body)
                    .into_iter()
                    .filter(|c| c.built)
                    .collect()
            }
            Ok(reply) => {
                error!("circuit-status query failed with status {}", reply.code);
                Vec::new()
            }
            Err(e) => {
                error!("Failed to query circuits: {}", e);
                *session = None;
                Vec::new()
            }
        }
    }

    /// True iff at least one fully built circuit exists
    pub async fn verify_circuit_health(&self) -> bool {
        let circuits = self.circuits().await;
        if circuits.is_empty() {
            warn!("No built circuits found");
            false
        } else {
            debug!("Found {} built circuit(s)", circuits.len());
            true
        }
    }

    /// Metadata for the exit relay of the most recent built circuit.
    /// Best-effort: missing directory data yields partial identity or None.
    pub async fn exit_identity(&self) -> Option<ExitIdentity> {
        let circuits = self.circuits().await;
        let exit_hop = circuits.first()?.path.last()?.clone();

        let mut identity = ExitIdentity {
            fingerprint: exit_hop.fingerprint.clone(),
            nickname: exit_hop.nickname.clone(),
            address: None,
            country: None,
        };

        let mut session = self.session.lock().await;
        let stream = session.as_mut()?;

        let ns_query = format!("GETINFO ns/id/${}", exit_hop.fingerprint);
        if let Ok(reply) = stream.command(&ns_query).await {
            if reply.is_ok() {
                let key = format!("ns/id/${}", exit_hop.fingerprint);
                if let Some(body) = getinfo_value(&reply.lines, &key) {
                    if let Some((nickname, address)) = parse_ns_row(&body) {
                        identity.nickname = Some(nickname);
                        identity.address = Some(address);
                    }
                }
            }
        }

        if let Some(address) = identity.address.clone() {
            let country_query = format!("GETINFO ip-to-country/{}", address);
            if let Ok(reply) = stream.command(&country_query).await {
                if reply.is_ok() {
                    let key = format!("ip-to-country/{}", address);
                    identity.country = getinfo_value(&reply.lines, &key)
                        .filter(|c| !c.is_empty() && c != "??");
                }
            }
        }

        debug!(
            "Exit relay: {} ({}, {})",
            identity.nickname.as_deref().unwrap_or("unknown"),
            identity.address.as_deref().unwrap_or("unknown"),
            identity.country.as_deref().unwrap_or("unknown"),
        );
        Some(identity)
    }

    /// Total NEWNYM signals accepted since construction
    pub fn rotation_count(&self) -> u64 {
        self.rotation_count.load(Ordering::SeqCst)
    }

    /// When the last rotation happened
    pub fn last_rotation(&self) -> Option<Instant> {
        *self.last_rotation.lock()
    }

    /// Release the control connection. Idempotent.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if let Some(stream) = session.as_mut() {
            // QUIT is a courtesy; the drop closes the socket either way
            let _ = stream.command("QUIT").await;
            debug!("Control connection closed");
        }
        *session = None;
    }
}

/// Pull the value for `key` out of GETINFO reply lines. Handles both the
/// inline `key=value` form and the multi-line data-block form.
fn getinfo_value(lines: &[String], key: &str) -> Option<String> {
    let prefix = format!("{}=", key);
    let start = lines.iter().position(|l| l.starts_with(&prefix))?;

    let mut parts = Vec::new();
    let inline = &lines[start][prefix.len()..];
    if !inline.is_empty() {
        parts.push(inline.to_string());
    }
    for line in &lines[start + 1..] {
        if line == "OK" {
            break;
        }
        parts.push(line.clone());
    }
    Some(parts.join("\n"))
}

/// Parse `circuit-status` body lines into circuits
fn parse_circuit_status(body: &str) -> Vec<CircuitInfo> {
    body.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.to_string();
            let status = fields.next()?;
            let path = fields
                .next()
                .filter(|f| f.starts_with('$'))
                .map(parse_circuit_path)
                .unwrap_or_default();

            Some(CircuitInfo {
                id,
                built: status == "BUILT",
                path,
            })
        })
        .collect()
}

/// Parse a `$FP~nick,$FP2~nick2` path field
fn parse_circuit_path(field: &str) -> Vec<CircuitHop> {
    field
        .split(',')
        .filter_map(|hop| {
            let hop = hop.strip_prefix('$').unwrap_or(hop);
            if hop.is_empty() {
                return None;
            }
            let (fingerprint, nickname) = match hop.split_once(['~', '=']) {
                Some((fp, nick)) => (fp.to_string(), Some(nick.to_string())),
                None => (hop.to_string(), None),
            };
            Some(CircuitHop {
                fingerprint,
                nickname,
            })
        })
        .collect()
}

/// Extract (nickname, address) from a router-status `r` line
fn parse_ns_row(body: &str) -> Option<(String, String)> {
    let row = body.lines().find(|l| l.starts_with("r "))?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 7 {
        return None;
    }
    Some((fields[1].to_string(), fields[6].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_circuit_status() {
        let body = "1 BUILT $AAAA~guard,$BBBB~middle,$CCCC~exit BUILD_FLAGS=NEED_CAPACITY\n\
                    2 LAUNCHED\n\
                    3 EXTENDED $DDDD~guard";
        let circuits = parse_circuit_status(body);

        assert_eq!(circuits.len(), 3);
        assert!(circuits[0].built);
        assert_eq!(circuits[0].path.len(), 3);
        assert_eq!(circuits[0].path[2].fingerprint, "CCCC");
        assert_eq!(circuits[0].path[2].nickname.as_deref(), Some("exit"));
        assert!(!circuits[1].built);
        assert!(circuits[1].path.is_empty());
    }

    #[test]
    fn test_parse_path_without_nicknames() {
        let hops = parse_circuit_path("$AAAA,$BBBB");
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].fingerprint, "AAAA");
        assert!(hops[0].nickname.is_none());
    }

    #[test]
    fn test_parse_ns_row() {
        let body = "r exitnode pGYy8K8JJWhGvuWwGJ8Wn1vDvRI abcdef 2026-01-01 12:00:00 185.220.101.5 9001 0\n\
                    s Exit Fast Running Stable Valid";
        let parsed = parse_ns_row(body);
        assert_eq!(
            parsed,
            Some(("exitnode".to_string(), "185.220.101.5".to_string()))
        );
    }

    #[test]
    fn test_getinfo_value_inline() {
        let lines = vec!["ip-to-country/185.220.101.5=de".to_string(), "OK".to_string()];
        assert_eq!(
            getinfo_value(&lines, "ip-to-country/185.220.101.5"),
            Some("de".to_string())
        );
    }

    #[test]
    fn test_getinfo_value_data_block() {
        let lines = vec![
            "circuit-status=".to_string(),
            "1 BUILT $AAAA~guard".to_string(),
            "2 LAUNCHED".to_string(),
            "OK".to_string(),
        ];
        let body = getinfo_value(&lines, "circuit-status").unwrap();
        assert_eq!(body, "1 BUILT $AAAA~guard\n2 LAUNCHED");
    }

    #[tokio::test]
    async fn test_rotate_requires_connection() {
        let controller = CircuitController::new(ControlConfig::default());
        assert!(!controller.is_connected().await);
        assert!(!controller.rotate_circuit().await);
        assert_eq!(controller.rotation_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let controller = CircuitController::new(ControlConfig::default());
        controller.close().await;
        controller.close().await;
        assert!(!controller.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_failure_is_nonfatal() {
        // Port 1 on loopback is refused, not filtered, so this fails fast
        let controller = CircuitController::new(ControlConfig {
            port: 1,
            ..Default::default()
        });
        assert!(!controller.connect().await);
        assert!(!controller.is_connected().await);
    }
}
