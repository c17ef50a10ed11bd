use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::codec::ProtocolError;
use crate::motd;

/// One (IPv4 address, port) pair proposed for probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Candidate(pub SocketAddrV4);

impl Candidate {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self(SocketAddrV4::new(ip, port))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Coarse failure classes. The scheduler treats both the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connect,
    Protocol,
}

/// Why a probe did not produce a status document.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("probe deadline exceeded")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("connection reset")]
    Reset,
    #[error("unreachable: {0}")]
    Unreachable(io::Error),
    /// The local host ran out of sockets or ports; counted towards fatal exhaustion.
    #[error("local resources exhausted: {0}")]
    ResourceExhausted(io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ProbeFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeFailure::Protocol(_) => FailureKind::Protocol,
            _ => FailureKind::Connect,
        }
    }

    /// Classify an I/O error raised while connecting or talking to a peer.
    ///
    /// `connected` tells whether the TCP session was already established; an
    /// EOF after that point means the server cut the exchange short.
    pub fn from_io(err: io::Error, connected: bool) -> Self {
        const ENFILE: i32 = 23;
        const EMFILE: i32 = 24;
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ProbeFailure::Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                ProbeFailure::Reset
            }
            io::ErrorKind::TimedOut => ProbeFailure::Timeout,
            io::ErrorKind::UnexpectedEof if connected => {
                ProbeFailure::Protocol(ProtocolError::Truncated)
            }
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::OutOfMemory => {
                ProbeFailure::ResourceExhausted(err)
            }
            _ if matches!(err.raw_os_error(), Some(ENFILE | EMFILE)) => {
                ProbeFailure::ResourceExhausted(err)
            }
            _ => ProbeFailure::Unreachable(err),
        }
    }
}

/// Outcome of one probe, flowing from a worker to the aggregator.
#[derive(Debug)]
pub enum ProbeResult {
    Responded(StatusReport),
    Failed(ProbeFailure),
}

/// A probe result tagged with its candidate.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub candidate: Candidate,
    pub result: ProbeResult,
}

/// Parsed status document plus the measured round trip.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: StatusResponse,
    pub latency: Duration,
}

/// The JSON document carried by a status response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    #[serde(default)]
    pub description: serde_json::Value,
    #[serde(default)]
    pub players: StatusPlayers,
    pub version: StatusVersion,
    #[serde(default)]
    pub favicon: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StatusPlayers {
    #[serde(default)]
    pub online: i64,
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub sample: Vec<PlayerSample>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlayerSample {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusVersion {
    #[serde(default)]
    pub name: String,
    pub protocol: i32,
}

impl StatusResponse {
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::InvalidStatus(e.to_string()))
    }
}

/// Server description in its raw (chat component) form and flattened to plain text.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Motd {
    pub raw: serde_json::Value,
    pub plain: String,
}

impl Motd {
    pub fn from_raw(raw: serde_json::Value) -> Self {
        let plain = motd::plain_text(&raw);
        Self { raw, plain }
    }
}

/// Persisted summary of one discovered server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerRecord {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol_version: i32,
    pub motd: Motd,
    pub player_count: i64,
    pub player_max: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub player_sample: Vec<String>,
    pub version_name: String,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(default)]
    pub favicon: Option<String>,
}

impl ServerRecord {
    /// Build a record from a successful probe observed at `seen_at`.
    pub fn from_report(candidate: Candidate, report: StatusReport, seen_at: OffsetDateTime) -> Self {
        let StatusReport { status, latency } = report;
        let player_sample = status
            .players
            .sample
            .into_iter()
            .map(|p| p.name)
            .filter(|n| !n.is_empty())
            .collect();
        Self {
            ip: candidate.ip(),
            port: candidate.port(),
            protocol_version: status.version.protocol,
            motd: Motd::from_raw(status.description),
            player_count: status.players.online,
            player_max: status.players.max,
            player_sample,
            version_name: status.version.name,
            latency_ms: latency.as_millis() as u64,
            first_seen: seen_at,
            last_seen: seen_at,
            favicon: status.favicon.filter(|f| !f.is_empty()),
        }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Best-effort game version extracted from `version_name`, e.g. `1.20.1` out of `Paper 1.20.1`.
    pub fn game_version(&self) -> &str {
        motd::base_version(&self.version_name).unwrap_or(&self.version_name)
    }
}

/// Counters emitted by the aggregator while a scan runs.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub connect_failures: u64,
    pub protocol_failures: u64,
    pub discovered: u64,
    pub updated: u64,
    pub store_size: usize,
    pub flushes: u64,
    pub persistence_degraded: bool,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "probed {} | responded {} (new {}) | failed {} | stored {} | {}s",
            self.attempted,
            self.succeeded,
            self.discovered,
            self.failed,
            self.store_size,
            self.elapsed.as_secs()
        )?;
        if self.persistence_degraded {
            write!(f, " | persistence degraded")?;
        }
        Ok(())
    }
}
