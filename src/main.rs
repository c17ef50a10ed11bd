use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ipnet::Ipv4Net;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mc_scan_rs::config::ScanConfig;
use mc_scan_rs::engine::{self, ScanSummary};
use mc_scan_rs::scanner::StopReason;
use mc_scan_rs::store::{stale_cutoff, ServerStore};
use mc_scan_rs::types::{Progress, ServerRecord};

/// mc-scan-rs — Discover public game servers by sampling random IPv4 addresses.
#[derive(Debug, Parser)]
#[command(
    name = "mc-scan-rs",
    version,
    about = "Discover public game servers by sampling random IPv4 addresses and running the status handshake.",
    long_about = None
)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. `info`, `mc_scan_rs=debug`).
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: String,

    /// JSON config file; command-line flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot file of discovered servers.
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Probe random public addresses until interrupted or a limit is reached.
    Scan(ScanArgs),
    /// Re-probe every stored server and update its status.
    Refresh(ProbeArgs),
    /// Print stored servers, busiest first.
    List {
        /// Show at most this many servers.
        #[arg(long)]
        limit: Option<usize>,

        /// Print the records as JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove servers that have not responded for a while.
    Prune {
        /// Age in hours after which a server is dropped.
        #[arg(long = "older-than-hours")]
        older_than_hours: u64,
    },
}

#[derive(Debug, Clone, Args)]
struct ProbeArgs {
    /// Max concurrent probes.
    #[arg(long)]
    workers: Option<usize>,

    /// Per-probe deadline in milliseconds (connect + handshake + status).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Delay between dispatches in milliseconds.
    #[arg(long = "pace-ms")]
    pace_ms: Option<u64>,

    /// Stop after this many probes.
    #[arg(long = "max-probes")]
    max_probes: Option<u64>,

    /// Stop after this many seconds.
    #[arg(long = "duration-secs")]
    duration_secs: Option<u64>,

    /// Protocol version announced in the handshake.
    #[arg(long = "protocol-version")]
    protocol_version: Option<i32>,
}

#[derive(Debug, Clone, Args)]
struct ScanArgs {
    #[command(flatten)]
    probe: ProbeArgs,

    /// Target port.
    #[arg(long)]
    port: Option<u16>,

    /// Extra CIDR block to skip (repeatable).
    #[arg(long)]
    exclude: Vec<Ipv4Net>,

    /// Flush after this many new or updated servers.
    #[arg(long = "flush-every")]
    flush_every: Option<u64>,

    /// Flush at least this often, in seconds.
    #[arg(long = "flush-interval-secs")]
    flush_interval_secs: Option<u64>,
}

impl ProbeArgs {
    fn apply(&self, config: &mut ScanConfig) {
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.pace_ms {
            config.pace_ms = v;
        }
        if self.max_probes.is_some() {
            config.max_probes = self.max_probes;
        }
        if self.duration_secs.is_some() {
            config.duration_secs = self.duration_secs;
        }
        if let Some(v) = self.protocol_version {
            config.protocol_version = v;
        }
    }
}

impl ScanArgs {
    fn apply(&self, config: &mut ScanConfig) {
        self.probe.apply(config);
        if let Some(v) = self.port {
            config.port = v;
        }
        config.exclude.extend(self.exclude.iter().copied());
        if let Some(v) = self.flush_every {
            config.flush_every = v;
        }
        if let Some(v) = self.flush_interval_secs {
            config.flush_interval_secs = v;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = match cli.config.as_deref() {
        Some(path) => ScanConfig::from_file(path)?,
        None => ScanConfig::default(),
    };
    if let Some(output) = cli.output {
        config.output_path = output;
    }

    match cli.command {
        Command::Scan(args) => {
            args.apply(&mut config);
            config.validate()?;
            print_config("scan", &config);
            let summary = engine::discover(&config, stop_on_ctrl_c(), print_progress).await?;
            print_summary(&summary);
        }
        Command::Refresh(args) => {
            args.apply(&mut config);
            config.validate()?;
            print_config("refresh", &config);
            let summary = engine::refresh(&config, stop_on_ctrl_c(), print_progress).await?;
            print_summary(&summary);
            print_servers_table(&summary.store().by_player_count());
        }
        Command::List { limit, json } => {
            let store = load_store(&config)?;
            let mut servers = store.by_player_count();
            if let Some(limit) = limit {
                servers.truncate(limit);
            }
            if json {
                write_servers_json(&servers)?;
            } else {
                print_servers_table(&servers);
            }
        }
        Command::Prune { older_than_hours } => {
            let mut store = load_store(&config)?;
            let cutoff = stale_cutoff(OffsetDateTime::now_utc(), older_than_hours).with_context(
                || format!("--older-than-hours {older_than_hours} is out of range"),
            )?;
            let removed = store.prune_older_than(cutoff);
            store
                .flush()
                .with_context(|| format!("failed to write {}", store.path().display()))?;
            println!(
                "Pruned {} server(s) not seen in {}h; {} remain in {}",
                removed,
                older_than_hours,
                store.len(),
                store.path().display()
            );
        }
    }

    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Ctrl-C stops dispatching; in-flight probes are allowed to finish.
fn stop_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested; waiting for in-flight probes");
            token.cancel();
        }
    });
    cancel
}

fn load_store(config: &ScanConfig) -> Result<ServerStore> {
    ServerStore::load(&config.output_path)
        .with_context(|| format!("failed to load {}", config.output_path.display()))
}

fn print_config(mode: &str, config: &ScanConfig) {
    println!("mc-scan-rs {mode} configuration:");
    println!("  port         : {}", config.port);
    println!("  workers      : {}", config.workers());
    println!("  timeout_ms   : {}", config.timeout_ms);
    println!("  pace_ms      : {}", config.pace_ms);
    println!(
        "  limits       : {} probes, {}",
        config
            .max_probes
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string()),
        config
            .duration_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "no time limit".to_string())
    );
    println!(
        "  flush        : every {} records / {}s",
        config.flush_every, config.flush_interval_secs
    );
    println!("  output       : {}", config.output_path.display());
    if !config.exclude.is_empty() {
        let blocks: Vec<String> = config.exclude.iter().map(|n| n.to_string()).collect();
        println!("  exclude      : {}", blocks.join(", "));
    }
}

fn print_progress(progress: &Progress) {
    println!("{progress}");
}

fn print_summary(summary: &ScanSummary) {
    let progress = summary.progress();
    let reason = match summary.scheduler.stop_reason {
        StopReason::Cancelled => "interrupted",
        StopReason::ProbeLimit => "probe limit reached",
        StopReason::TimeLimit => "time limit reached",
        StopReason::CandidatesExhausted => "no candidates left",
    };
    println!("\nScan finished ({reason}) after {}s", summary.scheduler.elapsed.as_secs());
    println!(
        "  probed {} | responded {} | failed {} (connect {}, protocol {}) | filtered {}",
        progress.attempted,
        progress.succeeded,
        progress.failed,
        progress.connect_failures,
        progress.protocol_failures,
        summary.scheduler.filtered
    );
    println!(
        "  new servers {} | updated {} | stored {} in {}",
        progress.discovered,
        progress.updated,
        progress.store_size,
        summary.store().path().display()
    );
    if !summary.aggregate.persisted {
        println!(
            "  WARNING: the last write to {} failed; results of this run may not be on disk",
            summary.store().path().display()
        );
    } else if summary.aggregate.degraded_episodes > 0 {
        println!(
            "  WARNING: persistence was degraded {} time(s) during the run",
            summary.aggregate.degraded_episodes
        );
    }
}

fn print_servers_table(servers: &[&ServerRecord]) {
    const MOTD_MAX: usize = 50;

    let rows: Vec<[String; 6]> = servers
        .iter()
        .map(|r| {
            let mut motd: String = r.motd.plain.replace('\n', " ");
            if motd.chars().count() > MOTD_MAX {
                motd = motd.chars().take(MOTD_MAX).collect::<String>() + "...";
            }
            [
                r.addr().to_string(),
                format!("{}/{}", r.player_count, r.player_max),
                r.game_version().to_string(),
                r.latency_ms.to_string(),
                r.last_seen
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| String::from("?")),
                motd,
            ]
        })
        .collect();

    let headers = ["address", "players", "version", "latency_ms", "last_seen", "motd"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    println!("\nServers: {}", rows.len());
    let line = |cells: [&str; 6]| {
        let mut out = String::new();
        for (i, (cell, w)) in cells.iter().zip(widths).enumerate() {
            if i > 0 {
                out.push_str("  ");
            }
            out.push_str(&format!("{cell:<w$}"));
        }
        println!("{}", out.trim_end());
    };
    line(headers);
    let dashes = widths.map(|w| "-".repeat(w));
    line(dashes.each_ref().map(String::as_str));
    for row in &rows {
        line(row.each_ref().map(String::as_str));
    }
}

fn write_servers_json(servers: &[&ServerRecord]) -> Result<()> {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    serde_json::to_writer_pretty(&mut lock, servers)?;
    writeln!(lock)?;
    Ok(())
}
