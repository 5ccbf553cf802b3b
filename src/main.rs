use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use leakbuster::{
    CipherBundle, ExtractConfig, HttpOracle, QueryPolicy, Session, SessionReport, SocketOracle,
    ValidityDecoder,
};

/// Recover secret plaintext through a padding or compression oracle.
#[derive(Parser)]
#[command(name = "leakbuster", version)]
#[command(about = "Adaptive side-channel extraction against padding and compression oracles")]
struct Cli {
    /// Attack strategy, matching the oracle's signal kind
    #[arg(value_enum)]
    mode: Mode,

    /// Oracle endpoint: host:port (padding) or URL (compression)
    endpoint: String,

    /// Ciphertext as literal hex, or @path to a hex file (padding mode)
    #[arg(long)]
    ciphertext: Option<String>,

    /// Known plaintext prefix to extend (compression mode)
    #[arg(long, default_value = "csawctf{")]
    prefix: String,

    /// Candidate symbols, swept in order
    #[arg(long, default_value = "abcdefghijklmnopqrstuvwxyz0123456789_}")]
    charset: String,

    /// Symbol that ends the extraction (compression mode)
    #[arg(long, default_value_t = '}')]
    terminator: char,

    /// Upper bound on recovered symbols (compression mode)
    #[arg(long, default_value_t = 64)]
    max_symbols: usize,

    /// Probe amplification factor (compression mode)
    #[arg(long, default_value_t = 5)]
    repeat: usize,

    /// Classify padding responses by latency (ms) instead of status tokens
    #[arg(long)]
    latency_threshold_ms: Option<u64>,

    /// Skip a banner line after connecting (padding mode)
    #[arg(long)]
    banner: bool,

    /// Per-query timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Retries per query before it counts as a non-success
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Oracle queries kept in flight per sweep
    #[arg(long, default_value_t = 32)]
    concurrency: usize,

    /// Print the full decision trace after the run
    #[arg(long)]
    show_trace: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Padding,
    Compression,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(cli).await {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<SessionReport> {
    let policy = QueryPolicy {
        timeout: Duration::from_millis(cli.timeout_ms),
        max_retries: cli.retries,
        sweep_width: cli.concurrency,
        ..QueryPolicy::default()
    };
    let session = Session::new(policy);

    // Ctrl-c cancels between rounds; partial progress is still reported.
    let cancel = session.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested; finishing the current sweep");
            cancel.cancel();
        }
    });

    let report = match cli.mode {
        Mode::Padding => {
            let arg = cli
                .ciphertext
                .as_deref()
                .context("--ciphertext is required in padding mode")?;
            let raw = read_ciphertext(arg)?;
            let bundle = CipherBundle::parse(&raw)?;
            let decoder = match cli.latency_threshold_ms {
                Some(ms) => ValidityDecoder::LatencyThreshold(Duration::from_millis(ms)),
                None => ValidityDecoder::default_tokens(),
            };
            let mut oracle = SocketOracle::new(cli.endpoint, decoder);
            if cli.banner {
                oracle = oracle.with_banner();
            }
            session.run_padding(&oracle, &bundle).await?
        }
        Mode::Compression => {
            let config = ExtractConfig {
                charset: cli.charset.into_bytes(),
                terminator: u8::try_from(cli.terminator)
                    .ok()
                    .context("terminator must be an ascii symbol")?,
                known_prefix: cli.prefix.into_bytes(),
                max_symbols: cli.max_symbols,
                amplification: cli.repeat,
            };
            let oracle = HttpOracle::new(cli.endpoint);
            session.run_compression(&oracle, &config).await?
        }
    };

    print_report(&report, cli.show_trace);
    Ok(report)
}

fn read_ciphertext(arg: &str) -> anyhow::Result<Vec<u8>> {
    let hex_str = match arg.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?
        }
        None => arg.to_string(),
    };
    let cleaned: String = hex_str.split_whitespace().collect();
    hex::decode(cleaned).context("ciphertext is not valid hex")
}

fn print_report(report: &SessionReport, show_trace: bool) {
    println!("recovered ({} bytes):", report.recovered.len());
    println!("  text: {}", String::from_utf8_lossy(&report.recovered));
    println!("  hex:  {}", hex::encode(&report.recovered));
    println!(
        "completeness: {}",
        if report.is_complete() { "full" } else { "partial" }
    );
    if !report.padding_intact {
        println!("warning: final pkcs7 padding did not validate; output is unstripped");
    }
    if show_trace {
        println!("trace ({} decisions):", report.trace.len());
        for entry in report.trace.entries() {
            println!("  {} | {} | {:?}", entry.query, entry.signal, entry.decision);
        }
    }
}
