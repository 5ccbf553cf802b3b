// CBC padding-oracle decryptor.
//
// For block C_i with predecessor P (the IV for i == 0), CBC gives
//
//                  plaintext_i = D(C_i) XOR P.
//
// We never learn D, but we can learn D(C_i) one byte at a time: submit
// MAC || ... || P' || C_i with a forged predecessor P' and ask the oracle
// whether the decryption of C_i under P' ends in valid PKCS#7 padding. When
// P'[pos] = g produces padding value `pad_val` at position pos, then
//
//                  D(C_i)[pos] = g XOR pad_val,
//
// and the true plaintext byte is D(C_i)[pos] XOR P[pos]. Solved positions are
// re-targeted to each new pad value so the tail of the forged decryption
// always reads pad_val, pad_val, ..., pad_val.
//
// The oracle under attack checks padding strictly before authentication, so
// an authentication failure is just as good as full success: both prove the
// padding stage passed.
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::block::{Block, BLOCK_SIZE};
use crate::bundle::CipherBundle;
use crate::error::ExtractionError;
use crate::oracle::{with_retry, QueryPolicy, ValidityOracle};
use crate::session::{AttackTrace, CancelFlag, Decision, TraceEntry};
use crate::signal::Validity;

/// Per-block buffer of the pre-XOR decryption output, built right-to-left.
/// A solved position is immutable thereafter; an unsolvable one keeps a zero
/// sentinel and is reported in the recovery.
#[derive(Debug, Clone)]
pub struct IntermediateState {
    bytes: [u8; BLOCK_SIZE],
    solved: [bool; BLOCK_SIZE],
}

impl IntermediateState {
    fn new() -> Self {
        Self {
            bytes: [0u8; BLOCK_SIZE],
            solved: [false; BLOCK_SIZE],
        }
    }

    fn solve(&mut self, position: usize, value: u8) {
        debug_assert!(!self.solved[position]);
        self.bytes[position] = value;
        self.solved[position] = true;
    }

    fn byte(&self, position: usize) -> u8 {
        self.bytes[position]
    }

    fn unresolved_positions(&self) -> Vec<usize> {
        (0..BLOCK_SIZE).filter(|&p| !self.solved[p]).collect()
    }

    fn plaintext(&self, predecessor: &Block) -> [u8; BLOCK_SIZE] {
        Block::new(self.bytes).xor(predecessor).to_array()
    }
}

/// Result of one full decryption run. `plaintext` has its PKCS#7 padding
/// stripped only when the strip checked out; `unresolved` lists every
/// (block, position) that fell back to the zero sentinel.
#[derive(Debug)]
pub struct Recovery {
    pub plaintext: Vec<u8>,
    pub padding_intact: bool,
    pub unresolved: Vec<(usize, usize)>,
    pub trace: AttackTrace,
}

struct BlockSolution {
    plaintext: [u8; BLOCK_SIZE],
    unresolved: Vec<usize>,
    decisions: Vec<TraceEntry>,
}

pub async fn decrypt<O: ValidityOracle>(
    bundle: &CipherBundle,
    oracle: &O,
    policy: &QueryPolicy,
    cancel: &CancelFlag,
) -> Result<Recovery, ExtractionError> {
    // Blocks only depend on their predecessor *ciphertext*, which is fixed,
    // so they are solved concurrently. Each future owns its own state; the
    // report is assembled in block order to keep the output deterministic.
    let solutions = join_all(
        (0..bundle.num_blocks()).map(|idx| solve_block(bundle, idx, oracle, policy, cancel)),
    )
    .await;

    let mut plaintext = Vec::with_capacity(bundle.num_blocks() * BLOCK_SIZE);
    let mut unresolved = Vec::new();
    let mut trace = AttackTrace::new();
    for (idx, solution) in solutions.into_iter().enumerate() {
        plaintext.extend_from_slice(&solution.plaintext);
        unresolved.extend(solution.unresolved.into_iter().map(|pos| (idx, pos)));
        trace.extend(solution.decisions);
    }

    let padding_intact = crate::block::pkcs7_unpad(&mut plaintext).is_ok();
    if !padding_intact {
        warn!("recovered plaintext does not end in valid pkcs7 padding; returning it unstripped");
    }
    if !unresolved.is_empty() {
        warn!(
            positions = unresolved.len(),
            "some byte positions could not be resolved; zero sentinels substituted"
        );
    }

    Ok(Recovery {
        plaintext,
        padding_intact,
        unresolved,
        trace,
    })
}

async fn solve_block<O: ValidityOracle>(
    bundle: &CipherBundle,
    idx: usize,
    oracle: &O,
    policy: &QueryPolicy,
    cancel: &CancelFlag,
) -> BlockSolution {
    let predecessor = *bundle.predecessor(idx);
    let target = bundle.blocks()[idx];
    let mut state = IntermediateState::new();
    let mut decisions = Vec::with_capacity(BLOCK_SIZE);

    for pad_val in 1..=BLOCK_SIZE as u8 {
        if cancel.is_cancelled() {
            decisions.push(TraceEntry {
                query: format!("block {idx}"),
                signal: "-".into(),
                decision: Decision::Cancelled,
            });
            break;
        }
        let position = BLOCK_SIZE - pad_val as usize;

        // Re-target every already-solved position so it still decrypts to
        // the current padding value under the new forged predecessor. No
        // position is ever left unforged, including pad_val == 1: a byte
        // that happens to satisfy the padding by coincidence must not be
        // trusted.
        let mut forged = *predecessor.as_bytes();
        for k in (position + 1)..BLOCK_SIZE {
            forged[k] = state.byte(k) ^ pad_val;
        }

        let query_desc = format!("block {idx} position {position} pad 0x{pad_val:02x}");
        match sweep_position(bundle, &target, forged, position, oracle, policy).await {
            Some((guess, signal)) => {
                let value = guess ^ pad_val;
                state.solve(position, value);
                debug!(
                    block = idx,
                    position,
                    guess,
                    plaintext_byte = value ^ predecessor.as_bytes()[position],
                    "byte solved"
                );
                decisions.push(TraceEntry {
                    query: query_desc,
                    signal: signal.to_string(),
                    decision: Decision::ByteSolved {
                        block: idx,
                        position,
                        guess,
                    },
                });
            }
            None => {
                warn!(block = idx, position, "no guess produced valid padding");
                decisions.push(TraceEntry {
                    query: query_desc,
                    signal: "none".into(),
                    decision: Decision::PositionUnresolved {
                        block: idx,
                        position,
                    },
                });
            }
        }
    }

    info!(block = idx, "block finished");
    BlockSolution {
        plaintext: state.plaintext(&predecessor),
        unresolved: state.unresolved_positions(),
        decisions,
    }
}

/// Scan all 256 candidate bytes for one position, `sweep_width` queries in
/// flight at a time. The winner is the first padding success in ascending
/// guess order, decided over the complete result set of each batch; arrival
/// order never influences the outcome.
///
/// A success at the final byte position does not count until a follow-up
/// query confirms it: the plaintext under the untouched predecessor may
/// already end in pad-shaped bytes, so a guess can complete that longer
/// padding by coincidence instead of producing a true `0x01`.
async fn sweep_position<O: ValidityOracle>(
    bundle: &CipherBundle,
    target: &Block,
    forged_base: [u8; BLOCK_SIZE],
    position: usize,
    oracle: &O,
    policy: &QueryPolicy,
) -> Option<(u8, Validity)> {
    let guesses: Vec<u8> = (0..=255).collect();
    for batch in guesses.chunks(policy.sweep_width.max(1)) {
        let probes = batch
            .iter()
            .map(|&guess| probe_guess(bundle, target, forged_base, position, guess, oracle, policy));
        for (guess, signal) in join_all(probes).await {
            match signal {
                Some(sig) if sig.padding_passed() => {
                    if position + 1 < BLOCK_SIZE
                        || confirm_final_byte(bundle, target, forged_base, guess, oracle, policy)
                            .await
                    {
                        return Some((guess, sig));
                    }
                    debug!(guess, "final-byte success failed confirmation; sweep continues");
                }
                Some(Validity::LengthInvalid) => {
                    // Forged queries preserve the wire length by
                    // construction, so this points at a transport problem.
                    warn!(guess, "oracle reported a length failure for a length-preserving query");
                }
                _ => {}
            }
        }
    }
    None
}

/// Re-query with the penultimate forged byte perturbed. Valid padding that
/// survives the perturbation can only be a lone `0x01`; padding that leaned
/// on its neighbouring bytes stops validating.
async fn confirm_final_byte<O: ValidityOracle>(
    bundle: &CipherBundle,
    target: &Block,
    forged_base: [u8; BLOCK_SIZE],
    guess: u8,
    oracle: &O,
    policy: &QueryPolicy,
) -> bool {
    let mut forged = forged_base;
    forged[BLOCK_SIZE - 1] = guess;
    forged[BLOCK_SIZE - 2] ^= 0xFF;
    let wire = bundle.forge_query(&Block::new(forged), target);
    with_retry(policy, || oracle.query(&wire))
        .await
        .map_or(false, |sig| sig.padding_passed())
}

async fn probe_guess<O: ValidityOracle>(
    bundle: &CipherBundle,
    target: &Block,
    forged_base: [u8; BLOCK_SIZE],
    position: usize,
    guess: u8,
    oracle: &O,
    policy: &QueryPolicy,
) -> (u8, Option<Validity>) {
    let mut forged = forged_base;
    forged[position] = guess;
    let wire = bundle.forge_query(&Block::new(forged), target);
    let signal = with_retry(policy, || oracle.query(&wire)).await;
    (guess, signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::future::Future;

    use crate::bundle::MAC_SIZE;
    use crate::error::TransportError;
    use crate::sim::{random_bytes_with_seed, CbcHmacService, FlakyOracle, LocalPaddingOracle};

    /// Oracle backed by a plain classification function, for exercising the
    /// sweep logic without a cipher.
    struct FnOracle<F>(F);

    impl<F> ValidityOracle for FnOracle<F>
    where
        F: Fn(&[u8]) -> Validity + Sync,
    {
        fn query(
            &self,
            ciphertext: &[u8],
        ) -> impl Future<Output = Result<Validity, TransportError>> + Send {
            let validity = (self.0)(ciphertext);
            async move { Ok(validity) }
        }
    }

    fn test_policy() -> QueryPolicy {
        QueryPolicy {
            timeout: std::time::Duration::from_secs(1),
            max_retries: 2,
            backoff: std::time::Duration::from_millis(1),
            sweep_width: 64,
        }
    }

    fn encrypting_service(plaintext: &[u8]) -> (CbcHmacService, Vec<u8>) {
        let mut service = CbcHmacService::new(
            random_bytes_with_seed::<16>(11),
            random_bytes_with_seed::<32>(12),
        );
        let wire = service.encrypt(plaintext, random_bytes_with_seed::<16>(13));
        (service, wire)
    }

    #[tokio::test]
    async fn recovers_plaintext_from_three_block_bundle() {
        // 43 bytes pads to 48: a 96-byte wire of 32 MAC + 16 IV + 48 CT.
        let plaintext = b"csawctf{p4dd1ng_0r4cl3s_st1ll_l34k_1n_2025}";
        let (service, wire) = encrypting_service(plaintext);
        assert_eq!(wire.len(), 96);
        let bundle = CipherBundle::parse(&wire).unwrap();
        let oracle = LocalPaddingOracle::new(service);

        let recovery = decrypt(&bundle, &oracle, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(recovery.plaintext, plaintext);
        assert!(recovery.padding_intact);
        assert!(recovery.unresolved.is_empty());
        // Worst case is 256 guesses per byte position.
        assert!(oracle.queries() <= 3 * 16 * 256);
    }

    #[tokio::test]
    async fn recovers_plaintext_whose_padding_is_a_single_byte() {
        // 47 bytes pads with a lone 0x01: the coincidental-validity boundary
        // at pad_val == 1 must still be forged, not skipped.
        let plaintext = b"exactly forty-seven bytes of plaintext go here!";
        assert_eq!(plaintext.len(), 47);
        let (service, wire) = encrypting_service(plaintext);
        let bundle = CipherBundle::parse(&wire).unwrap();
        let oracle = LocalPaddingOracle::new(service);

        let recovery = decrypt(&bundle, &oracle, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(recovery.plaintext, plaintext);
        assert!(recovery.padding_intact);
    }

    #[tokio::test]
    async fn recovers_plaintext_when_the_tail_mimics_shorter_padding() {
        // 44 bytes pads with 04 04 04 04. Under this key the guess that
        // turns the last byte into a fourth 0x04 sweeps before the true
        // 0x01 guess and only falls away at the confirmation query; without
        // it the whole final block garbles.
        let plaintext = b"the wire and the engine agree on every token";
        let mut service = CbcHmacService::new(
            random_bytes_with_seed::<16>(21),
            random_bytes_with_seed::<32>(22),
        );
        let wire = service.encrypt(plaintext, random_bytes_with_seed::<16>(23));
        let bundle = CipherBundle::parse(&wire).unwrap();
        let oracle = LocalPaddingOracle::new(service);

        let recovery = decrypt(&bundle, &oracle, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(recovery.plaintext, plaintext);
        assert!(recovery.padding_intact);
        assert!(recovery.unresolved.is_empty());
    }

    #[tokio::test]
    async fn final_byte_sweep_rejects_padding_borrowed_from_neighbours() {
        // Plaintext bytes here are forged_prev XOR mask. mask[14] makes the
        // penultimate byte 0x02 under the untouched base, so guess 0x01
        // yields a last byte of 0x02 and validates as two-byte padding; the
        // later guess 0x02 yields the true lone 0x01 and must win.
        let raw = [vec![0u8; MAC_SIZE], vec![0u8; 2 * BLOCK_SIZE]].concat();
        let bundle = CipherBundle::parse(&raw).unwrap();
        let mask: [u8; BLOCK_SIZE] = {
            let mut mask = [0u8; BLOCK_SIZE];
            mask[14] = 0x02;
            mask[15] = 0x03;
            mask
        };
        let oracle = FnOracle(move |query: &[u8]| {
            let forged_prev = &query[query.len() - 2 * BLOCK_SIZE..query.len() - BLOCK_SIZE];
            let mut plain: Vec<u8> = forged_prev
                .iter()
                .zip(mask.iter())
                .map(|(f, m)| f ^ m)
                .collect();
            if crate::block::pkcs7_unpad(&mut plain).is_ok() {
                Validity::AuthInvalid
            } else {
                Validity::PaddingInvalid
            }
        });

        let winner = sweep_position(
            &bundle,
            &bundle.blocks()[0],
            [0u8; BLOCK_SIZE],
            BLOCK_SIZE - 1,
            &oracle,
            &test_policy(),
        )
        .await;

        assert_eq!(winner, Some((0x02, Validity::AuthInvalid)));
    }

    #[tokio::test]
    async fn two_runs_produce_identical_decision_sequences() {
        let plaintext = b"same trace twice, or the attack is not deterministic";
        let (service, wire) = encrypting_service(plaintext);
        let bundle = CipherBundle::parse(&wire).unwrap();
        let oracle = LocalPaddingOracle::new(service);

        let first = decrypt(&bundle, &oracle, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();
        let second = decrypt(&bundle, &oracle, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        let first_decisions: Vec<_> = first.trace.decisions().cloned().collect();
        let second_decisions: Vec<_> = second.trace.decisions().cloned().collect();
        assert_eq!(first_decisions, second_decisions);
    }

    /// Asserts the wire length of every query on its way to the inner
    /// oracle: a wrong-length forgery fails the test the moment it is sent.
    struct LengthAsserting<O> {
        inner: O,
        expected: usize,
    }

    impl<O: ValidityOracle> ValidityOracle for LengthAsserting<O> {
        fn query(
            &self,
            ciphertext: &[u8],
        ) -> impl Future<Output = Result<Validity, TransportError>> + Send {
            assert_eq!(ciphertext.len(), self.expected);
            self.inner.query(ciphertext)
        }
    }

    #[tokio::test]
    async fn every_forged_query_preserves_wire_length() {
        let plaintext = b"length is checked before padding, padding before auth";
        let (service, wire) = encrypting_service(plaintext);
        let bundle = CipherBundle::parse(&wire).unwrap();
        let oracle = LengthAsserting {
            inner: LocalPaddingOracle::new(service),
            expected: wire.len(),
        };

        let recovery = decrypt(&bundle, &oracle, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(recovery.plaintext, plaintext);
        assert!(recovery.unresolved.is_empty());
    }

    #[tokio::test]
    async fn retries_ride_out_intermittent_transport_failures() {
        let plaintext = b"one slow guess must not stall the whole position";
        let (service, wire) = encrypting_service(plaintext);
        let bundle = CipherBundle::parse(&wire).unwrap();
        // Every 10th query fails at the transport layer on its first attempt.
        let oracle = FlakyOracle::new(LocalPaddingOracle::new(service), 10);

        let recovery = decrypt(&bundle, &oracle, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(recovery.plaintext, plaintext);
        assert!(recovery.unresolved.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_positions_get_sentinels_and_do_not_abort() {
        let raw = [vec![0x5Au8; MAC_SIZE], vec![0xC3u8; 3 * BLOCK_SIZE]].concat();
        let bundle = CipherBundle::parse(&raw).unwrap();
        // An oracle that never confirms padding leaves every position
        // unresolved; the run must still complete and say so.
        let stubborn = FnOracle(|_: &[u8]| Validity::PaddingInvalid);

        let recovery = decrypt(&bundle, &stubborn, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(recovery.unresolved.len(), bundle.num_blocks() * BLOCK_SIZE);
        assert!(!recovery.padding_intact);
        assert_eq!(recovery.plaintext.len(), bundle.num_blocks() * BLOCK_SIZE);
    }

    #[tokio::test]
    async fn first_success_tie_break_is_by_guess_value() {
        // Two guesses classify as padding success; ascending guess order
        // must win regardless of dispatch or completion order.
        let raw = [vec![0u8; MAC_SIZE], vec![0u8; 2 * BLOCK_SIZE]].concat();
        let bundle = CipherBundle::parse(&raw).unwrap();
        let position = BLOCK_SIZE - 1;
        let oracle = FnOracle(move |query: &[u8]| {
            let forged_prev = &query[query.len() - 2 * BLOCK_SIZE..query.len() - BLOCK_SIZE];
            if forged_prev[position] == 0x17 || forged_prev[position] == 0x42 {
                Validity::AuthInvalid
            } else {
                Validity::PaddingInvalid
            }
        });

        let winner = sweep_position(
            &bundle,
            &bundle.blocks()[0],
            [0u8; BLOCK_SIZE],
            position,
            &oracle,
            &test_policy(),
        )
        .await;

        assert_eq!(winner, Some((0x17, Validity::AuthInvalid)));
    }

    #[tokio::test]
    async fn cancellation_returns_partial_state() {
        let plaintext = b"cancelled sessions keep their partial trace";
        let (service, wire) = encrypting_service(plaintext);
        let bundle = CipherBundle::parse(&wire).unwrap();
        let oracle = LocalPaddingOracle::new(service);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let recovery = decrypt(&bundle, &oracle, &test_policy(), &cancel)
            .await
            .unwrap();

        assert_eq!(recovery.unresolved.len(), bundle.num_blocks() * BLOCK_SIZE);
        assert!(recovery
            .trace
            .decisions()
            .all(|d| *d == Decision::Cancelled));
    }
}
