// Oracle signals and their classification.
//
// The engine never interprets raw transport responses itself; an adapter
// turns them into one of these fixed variants up front. Classification is an
// exact-token table (or a latency threshold for oracles that leak only
// timing), never substring search on human-readable error text.
use std::time::Duration;

use crate::error::TransportError;

/// Outcome of one padding-oracle query. Which variants count as "good" is
/// policy that belongs to the attack, not to this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Ok,
    PaddingInvalid,
    AuthInvalid,
    LengthInvalid,
}

impl Validity {
    /// True when the padding-check stage demonstrably passed. An oracle that
    /// validates padding strictly before authentication proves this both on
    /// full success and on an authentication failure.
    pub fn padding_passed(self) -> bool {
        matches!(self, Validity::Ok | Validity::AuthInvalid)
    }
}

impl std::fmt::Display for Validity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Validity::Ok => "ok",
            Validity::PaddingInvalid => "padding-invalid",
            Validity::AuthInvalid => "auth-invalid",
            Validity::LengthInvalid => "length-invalid",
        };
        write!(f, "{name}")
    }
}

/// A scalar leak: a ciphertext length or a timing measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Magnitude(pub u64);

impl std::fmt::Display for Magnitude {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps a raw oracle response to a `Validity` variant.
#[derive(Debug, Clone)]
pub enum ValidityDecoder {
    /// Exact match of the trimmed status line against per-variant tokens.
    TokenTable {
        ok: Vec<String>,
        padding_invalid: Vec<String>,
        auth_invalid: Vec<String>,
        length_invalid: Vec<String>,
    },
    /// Some oracles answer identically either way and leak only through
    /// response time: a valid-padding path runs the (slow) authentication
    /// stage, an invalid-padding path bails out immediately.
    LatencyThreshold(Duration),
}

impl ValidityDecoder {
    /// Token table for the line-oriented oracle protocol this engine was
    /// built against.
    pub fn default_tokens() -> Self {
        ValidityDecoder::TokenTable {
            ok: vec!["valid".into()],
            padding_invalid: vec!["padding_error".into()],
            auth_invalid: vec!["mac_error".into()],
            length_invalid: vec!["length_error".into()],
        }
    }

    pub fn decode(&self, status_line: &str, elapsed: Duration) -> Result<Validity, TransportError> {
        match self {
            ValidityDecoder::TokenTable {
                ok,
                padding_invalid,
                auth_invalid,
                length_invalid,
            } => {
                let line = status_line.trim();
                let hit = |tokens: &[String]| tokens.iter().any(|t| t == line);
                if hit(ok) {
                    Ok(Validity::Ok)
                } else if hit(padding_invalid) {
                    Ok(Validity::PaddingInvalid)
                } else if hit(auth_invalid) {
                    Ok(Validity::AuthInvalid)
                } else if hit(length_invalid) {
                    Ok(Validity::LengthInvalid)
                } else {
                    Err(TransportError::Protocol(format!(
                        "unrecognised oracle response: {line:?}"
                    )))
                }
            }
            ValidityDecoder::LatencyThreshold(threshold) => {
                if elapsed >= *threshold {
                    Ok(Validity::AuthInvalid)
                } else {
                    Ok(Validity::PaddingInvalid)
                }
            }
        }
    }
}
