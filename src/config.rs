//! Scan configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::probe::ProbeOptions;
use crate::sampler::AddressFilter;

/// Upper bound on concurrent probe slots.
pub const MAX_WORKERS: usize = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Target port for every sampled address (default: 25565)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Concurrent probe slots
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-probe deadline covering connect, handshake and status
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Flush after this many new or updated records
    #[serde(default = "default_flush_every")]
    pub flush_every: u64,

    /// Flush at least this often while there are unsaved records (seconds)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Snapshot file of discovered servers
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,

    /// Delay between two dispatches (0 = no pacing)
    #[serde(default)]
    pub pace_ms: u64,

    /// Stop after this many probes have been dispatched
    #[serde(default)]
    pub max_probes: Option<u64>,

    /// Stop after this many seconds
    #[serde(default)]
    pub duration_secs: Option<u64>,

    /// Protocol version announced in the handshake
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,

    /// Extra blocks never probed, on top of the reserved ranges
    #[serde(default)]
    pub exclude: Vec<Ipv4Net>,

    /// How often a progress line is emitted (seconds)
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Consecutive resource-exhaustion failures before the scan is aborted
    #[serde(default = "default_exhaustion_threshold")]
    pub exhaustion_threshold: u64,
}

fn default_port() -> u16 {
    25565
}

fn default_workers() -> usize {
    200
}

fn default_timeout_ms() -> u64 {
    1500
}

fn default_flush_every() -> u64 {
    25
}

fn default_flush_interval() -> u64 {
    30
}

fn default_output_path() -> PathBuf {
    PathBuf::from("discovered_servers.json")
}

fn default_protocol_version() -> i32 {
    47
}

fn default_progress_interval() -> u64 {
    5
}

fn default_exhaustion_threshold() -> u64 {
    512
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            workers: default_workers(),
            timeout_ms: default_timeout_ms(),
            flush_every: default_flush_every(),
            flush_interval_secs: default_flush_interval(),
            output_path: default_output_path(),
            pace_ms: 0,
            max_probes: None,
            duration_secs: None,
            protocol_version: default_protocol_version(),
            exclude: Vec::new(),
            progress_interval_secs: default_progress_interval(),
            exhaustion_threshold: default_exhaustion_threshold(),
        }
    }
}

impl ScanConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: ScanConfig = serde_json::from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be in 1..=65535");
        }
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be positive");
        }
        if self.flush_every == 0 && self.flush_interval_secs == 0 {
            bail!("either flush_every or flush_interval_secs must be positive");
        }
        if self.exhaustion_threshold == 0 {
            bail!("exhaustion_threshold must be positive");
        }
        Ok(())
    }

    /// Effective pool width.
    pub fn workers(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn pace(&self) -> Option<Duration> {
        (self.pace_ms > 0).then(|| Duration::from_millis(self.pace_ms))
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            timeout: self.timeout(),
            protocol_version: self.protocol_version,
        }
    }

    pub fn address_filter(&self) -> AddressFilter {
        AddressFilter::new(self.exclude.iter().copied())
    }
}
