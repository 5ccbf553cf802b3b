// Compression-oracle (CRIME/BREACH-style) extractor.
//
// The oracle reports the length of compress(secret || payload). A probe of
// (known + c) repeated R times compresses measurably better when `known + c`
// extends the true secret, because the back-reference into the secret grows
// by a symbol instead of forcing a literal. Greedily appending the
// minimum-magnitude symbol recovers the secret left to right.
use futures::future::join_all;
use tracing::{info, warn};

use crate::error::ExtractionError;
use crate::oracle::{with_retry, MagnitudeOracle, QueryPolicy};
use crate::session::{AttackTrace, CancelFlag, Decision, TraceEntry};
use crate::signal::Magnitude;

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub charset: Vec<u8>,
    pub terminator: u8,
    pub known_prefix: Vec<u8>,
    pub max_symbols: usize,
    /// Probe repetition count; higher values sharpen the length differential
    /// at the cost of a larger oracle-visible payload.
    pub amplification: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            charset: b"abcdefghijklmnopqrstuvwxyz0123456789_}".to_vec(),
            terminator: b'}',
            known_prefix: b"csawctf{".to_vec(),
            max_symbols: 64,
            amplification: 5,
        }
    }
}

/// Recovered symbols plus whether the terminator was actually reached.
#[derive(Debug)]
pub struct Extraction {
    pub recovered: Vec<u8>,
    pub complete: bool,
    pub trace: AttackTrace,
}

pub async fn extract<O: MagnitudeOracle>(
    oracle: &O,
    config: &ExtractConfig,
    policy: &QueryPolicy,
    cancel: &CancelFlag,
) -> Result<Extraction, ExtractionError> {
    if config.charset.is_empty() {
        return Err(ExtractionError::MalformedInput(
            "charset must not be empty".into(),
        ));
    }
    if config.amplification == 0 {
        return Err(ExtractionError::MalformedInput(
            "amplification factor must be at least 1".into(),
        ));
    }

    let mut known = config.known_prefix.clone();
    let mut trace = AttackTrace::new();
    let mut appended = 0usize;
    let mut complete = known.last() == Some(&config.terminator);

    while !complete && appended < config.max_symbols {
        if cancel.is_cancelled() {
            trace.push(TraceEntry {
                query: format!("round {appended}"),
                signal: "-".into(),
                decision: Decision::Cancelled,
            });
            break;
        }

        let (symbol, magnitude) = sweep_round(oracle, config, policy, &known).await?;
        known.push(symbol);
        appended += 1;
        info!(
            symbol = %(symbol as char),
            magnitude = magnitude.0,
            recovered = %String::from_utf8_lossy(&known),
            "symbol chosen"
        );
        trace.push(TraceEntry {
            query: format!(
                "charset sweep after {:?}",
                String::from_utf8_lossy(&known[..known.len() - 1])
            ),
            signal: magnitude.to_string(),
            decision: Decision::SymbolChosen {
                index: appended - 1,
                symbol,
            },
        });

        if symbol == config.terminator {
            complete = true;
        }
    }

    if !complete {
        warn!(
            max_symbols = config.max_symbols,
            "extraction stopped before the terminator; returning the accumulated prefix"
        );
    }
    Ok(Extraction {
        recovered: known,
        complete,
        trace,
    })
}

/// Probe every charset symbol once and pick the minimum magnitude; ties go
/// to the earliest symbol in charset order. The minimum is only meaningful
/// over the full charset: symbols whose probes all went unanswered get one
/// more round of retries, and a round that still cannot score every symbol
/// aborts the run rather than deciding on a skewed subset.
async fn sweep_round<O: MagnitudeOracle>(
    oracle: &O,
    config: &ExtractConfig,
    policy: &QueryPolicy,
    known: &[u8],
) -> Result<(u8, Magnitude), ExtractionError> {
    let mut results: Vec<(u8, Option<Magnitude>)> = Vec::with_capacity(config.charset.len());
    for batch in config.charset.chunks(policy.sweep_width.max(1)) {
        let probes = batch.iter().map(|&symbol| async move {
            let payload = build_probe(known, symbol, config.amplification);
            let magnitude = with_retry(policy, || oracle.query(&payload)).await;
            (symbol, magnitude)
        });
        results.extend(join_all(probes).await);
    }

    if results.iter().any(|(_, magnitude)| magnitude.is_none()) {
        warn!("some probes went unanswered; re-probing before scoring the round");
        for (symbol, magnitude) in results.iter_mut() {
            if magnitude.is_none() {
                let payload = build_probe(known, *symbol, config.amplification);
                *magnitude = with_retry(policy, || oracle.query(&payload)).await;
            }
        }
        if results.iter().any(|(_, magnitude)| magnitude.is_none()) {
            return Err(ExtractionError::OracleUnavailable);
        }
    }

    // Minimum over the complete, charset-ordered result set; the strict `<`
    // makes ties fall to the first symbol encountered.
    let mut best: Option<(u8, Magnitude)> = None;
    for (symbol, magnitude) in results {
        if let Some(magnitude) = magnitude {
            if best.map_or(true, |(_, m)| magnitude < m) {
                best = Some((symbol, magnitude));
            }
        }
    }
    best.ok_or(ExtractionError::OracleUnavailable)
}

fn build_probe(known: &[u8], symbol: u8, amplification: usize) -> Vec<u8> {
    let mut candidate = known.to_vec();
    candidate.push(symbol);
    candidate.repeat(amplification)
}
