// Attack session driver: owns the query policy and cancellation, runs one
// strategy, and packages whatever was recovered together with the trace.
// Partial progress is always returned with an explicit completeness flag;
// the driver never silently truncates.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bundle::CipherBundle;
use crate::decrypt::decrypt;
use crate::error::ExtractionError;
use crate::extract::{extract, ExtractConfig};
use crate::oracle::{MagnitudeOracle, QueryPolicy, ValidityOracle};

/// Cooperative cancellation, checked between rounds (never mid-sweep, so a
/// trace never records a half-evaluated decision).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What the engine decided after evaluating one complete sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    ByteSolved {
        block: usize,
        position: usize,
        guess: u8,
    },
    PositionUnresolved {
        block: usize,
        position: usize,
    },
    SymbolChosen {
        index: usize,
        symbol: u8,
    },
    Cancelled,
}

/// One trace record: which query family was in play, the signal that settled
/// it, and the decision taken. Diagnostic only; correctness never reads it.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub query: String,
    pub signal: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Default)]
pub struct AttackTrace {
    entries: Vec<TraceEntry>,
}

impl AttackTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = TraceEntry>) {
        self.entries.extend(entries);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn decisions(&self) -> impl Iterator<Item = &Decision> {
        self.entries.iter().map(|e| &e.decision)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Full,
    Partial,
}

#[derive(Debug)]
pub struct SessionReport {
    pub recovered: Vec<u8>,
    pub completion: Completion,
    /// Padding mode only: false when the final PKCS#7 strip did not check
    /// out and the plaintext is returned unstripped.
    pub padding_intact: bool,
    pub trace: AttackTrace,
}

impl SessionReport {
    pub fn is_complete(&self) -> bool {
        self.completion == Completion::Full
    }

    /// CLI contract: 0 full recovery, 2 partial.
    pub fn exit_code(&self) -> u8 {
        match self.completion {
            Completion::Full => 0,
            Completion::Partial => 2,
        }
    }
}

pub struct Session {
    policy: QueryPolicy,
    cancel: CancelFlag,
}

impl Session {
    pub fn new(policy: QueryPolicy) -> Self {
        Self {
            policy,
            cancel: CancelFlag::new(),
        }
    }

    /// Handle for cancelling this session from outside (e.g. a ctrl-c
    /// handler). Takes effect between rounds.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run_padding<O: ValidityOracle>(
        &self,
        oracle: &O,
        bundle: &CipherBundle,
    ) -> Result<SessionReport, ExtractionError> {
        let recovery = decrypt(bundle, oracle, &self.policy, &self.cancel).await?;
        let completion = if recovery.unresolved.is_empty() && !self.cancel.is_cancelled() {
            Completion::Full
        } else {
            Completion::Partial
        };
        Ok(SessionReport {
            recovered: recovery.plaintext,
            completion,
            padding_intact: recovery.padding_intact,
            trace: recovery.trace,
        })
    }

    pub async fn run_compression<O: MagnitudeOracle>(
        &self,
        oracle: &O,
        config: &ExtractConfig,
    ) -> Result<SessionReport, ExtractionError> {
        let extraction = extract(oracle, config, &self.policy, &self.cancel).await?;
        let completion = if extraction.complete {
            Completion::Full
        } else {
            Completion::Partial
        };
        Ok(SessionReport {
            recovered: extraction.recovered,
            completion,
            padding_intact: true,
            trace: extraction.trace,
        })
    }
}
