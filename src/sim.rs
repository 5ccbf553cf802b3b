// Local replicas of the two vulnerable services, for offline verification
// and tests. This module is the only place in the tree that holds key
// material; the engine reaches it exclusively through the oracle port
// traits, which have nowhere to put a key.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use miniz_oxide::deflate::core::{
    compress, create_comp_flags_from_zip_params, CompressionStrategy, CompressorOxide, TDEFLFlush,
    TDEFLStatus,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::block::{pkcs7_unpad, BLOCK_SIZE};
use crate::bundle::MAC_SIZE;
use crate::error::TransportError;
use crate::oracle::{MagnitudeOracle, ValidityOracle};
use crate::signal::{Magnitude, Validity};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
}

pub fn random_bytes_with_seed<const N: usize>(seed: u64) -> [u8; N] {
    let mut bytes = [0u8; N];
    StdRng::seed_from_u64(seed).fill(&mut bytes[..]);
    bytes
}

/// AES-128-CBC + HMAC-SHA256 service with the padding-before-authentication
/// flaw: validation runs length, then padding, then MAC, and the failing
/// stage is observable. `encrypt` fixes the expected wire length; every
/// later query is measured against it.
pub struct CbcHmacService {
    enc_key: [u8; 16],
    mac_key: [u8; 32],
    expected_len: usize,
}

impl CbcHmacService {
    pub fn new(enc_key: [u8; 16], mac_key: [u8; 32]) -> Self {
        Self {
            enc_key,
            mac_key,
            expected_len: 0,
        }
    }

    /// Produce `mac || iv || ct` and pin the service to that wire length.
    pub fn encrypt(&mut self, plaintext: &[u8], iv: [u8; BLOCK_SIZE]) -> Vec<u8> {
        let ct = Aes128CbcEnc::new(&self.enc_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let mut wire = Vec::with_capacity(MAC_SIZE + BLOCK_SIZE + ct.len());
        wire.extend_from_slice(&self.mac_of(&iv, &ct));
        wire.extend_from_slice(&iv);
        wire.extend_from_slice(&ct);
        self.expected_len = wire.len();
        wire
    }

    pub fn classify(&self, wire: &[u8]) -> Validity {
        if wire.len() != self.expected_len {
            return Validity::LengthInvalid;
        }
        let mac = &wire[..MAC_SIZE];
        let iv: [u8; BLOCK_SIZE] = wire[MAC_SIZE..MAC_SIZE + BLOCK_SIZE]
            .try_into()
            .expect("slice is block sized");
        let ct = &wire[MAC_SIZE + BLOCK_SIZE..];

        let decrypted = Aes128CbcDec::new(&self.enc_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ct);
        let mut plaintext = match decrypted {
            Ok(plaintext) => plaintext,
            Err(_) => return Validity::PaddingInvalid,
        };
        if pkcs7_unpad(&mut plaintext).is_err() {
            return Validity::PaddingInvalid;
        }
        if self.mac_of(&iv, ct) != *mac {
            return Validity::AuthInvalid;
        }
        Validity::Ok
    }

    fn mac_of(&self, iv: &[u8], ct: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac =
            HmacSha256::new_from_slice(&self.mac_key).expect("hmac accepts any key length");
        mac.update(iv);
        mac.update(ct);
        mac.finalize().into_bytes().into()
    }
}

/// In-process padding oracle over a `CbcHmacService`, with a query counter.
pub struct LocalPaddingOracle {
    service: CbcHmacService,
    queries: AtomicU64,
}

impl LocalPaddingOracle {
    pub fn new(service: CbcHmacService) -> Self {
        Self {
            service,
            queries: AtomicU64::new(0),
        }
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

impl ValidityOracle for LocalPaddingOracle {
    fn query(
        &self,
        ciphertext: &[u8],
    ) -> impl Future<Output = Result<Validity, TransportError>> + Send {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let validity = self.service.classify(ciphertext);
        async move { Ok(validity) }
    }
}

/// The compressed-transcript side of the CRIME setup: raw deflate over
/// `secret || payload`, pinned to the fixed Huffman table like the service
/// it replicates. An adaptive table would couple the code lengths to the
/// probe and blur the one-literal differential the attack measures. The
/// downstream stream cipher preserves length, so the "ciphertext" is the
/// compressed record itself.
pub struct DeflateService {
    secret: Vec<u8>,
}

impl DeflateService {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    pub fn record(&self, payload: &[u8]) -> Vec<u8> {
        let mut stream = Vec::with_capacity(self.secret.len() + payload.len());
        stream.extend_from_slice(&self.secret);
        stream.extend_from_slice(payload);
        deflate_fixed(&stream)
    }

    pub fn record_len(&self, payload: &[u8]) -> u64 {
        self.record(payload).len() as u64
    }
}

// Raw deflate (no zlib wrapper) with the fixed Huffman strategy. flate2 does
// not expose the strategy parameter, so this goes through its miniz backend
// directly.
fn deflate_fixed(data: &[u8]) -> Vec<u8> {
    let flags = create_comp_flags_from_zip_params(6, -15, CompressionStrategy::Fixed as i32);
    let mut compressor = CompressorOxide::new(flags);
    let mut output = vec![0u8; data.len().max(64)];
    let mut in_pos = 0;
    let mut out_pos = 0;
    loop {
        let (status, consumed, written) = compress(
            &mut compressor,
            &data[in_pos..],
            &mut output[out_pos..],
            TDEFLFlush::Finish,
        );
        in_pos += consumed;
        out_pos += written;
        match status {
            TDEFLStatus::Done => {
                output.truncate(out_pos);
                return output;
            }
            TDEFLStatus::Okay => {
                if output.len() - out_pos < 64 {
                    output.resize(output.len() * 2, 0);
                }
            }
            status => panic!("deflate failed: {status:?}"),
        }
    }
}

pub struct LocalCompressionOracle {
    service: DeflateService,
}

impl LocalCompressionOracle {
    pub fn new(service: DeflateService) -> Self {
        Self { service }
    }
}

impl MagnitudeOracle for LocalCompressionOracle {
    fn query(&self, payload: &[u8]) -> impl Future<Output = Result<Magnitude, TransportError>> + Send {
        let magnitude = Magnitude(self.service.record_len(payload));
        async move { Ok(magnitude) }
    }
}

/// Injects a deterministic transport failure on every `period`-th call
/// (counting retries), so retry paths can be tested without randomness.
pub struct FlakyOracle<O> {
    inner: O,
    period: u64,
    calls: AtomicU64,
}

impl<O> FlakyOracle<O> {
    pub fn new(inner: O, period: u64) -> Self {
        assert!(period > 0);
        Self {
            inner,
            period,
            calls: AtomicU64::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        self.calls.fetch_add(1, Ordering::Relaxed) % self.period == 0
    }
}

impl<O: ValidityOracle> ValidityOracle for FlakyOracle<O> {
    fn query(
        &self,
        ciphertext: &[u8],
    ) -> impl Future<Output = Result<Validity, TransportError>> + Send {
        let fail = self.should_fail();
        async move {
            if fail {
                return Err(TransportError::Protocol("injected failure".into()));
            }
            self.inner.query(ciphertext).await
        }
    }
}

impl<O: MagnitudeOracle> MagnitudeOracle for FlakyOracle<O> {
    fn query(&self, payload: &[u8]) -> impl Future<Output = Result<Magnitude, TransportError>> + Send {
        let fail = self.should_fail();
        async move {
            if fail {
                return Err(TransportError::Protocol("injected failure".into()));
            }
            self.inner.query(payload).await
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    data: String,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    error: String,
    ciphertext: String,
}

/// HTTP replica of the compression endpoint:
/// `POST /send {"data": ...}` → `{"error": ..., "ciphertext": <base64>}`.
pub async fn spawn_compression_server(secret: &[u8]) -> String {
    let service = Arc::new(DeflateService::new(secret));
    let app = Router::new().route(
        "/send",
        post(move |Json(request): Json<SendRequest>| {
            let service = Arc::clone(&service);
            async move {
                let record = service.record(request.data.as_bytes());
                Json(SendResponse {
                    error: "Transmission failure".into(),
                    ciphertext: BASE64.encode(record),
                })
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("could not bind sim http server");
    let addr = listener.local_addr().expect("listener has a local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("sim http server failed");
    });
    format!("http://{addr}/send")
}

/// TCP replica of the line-oriented padding oracle: hex ciphertext in, one
/// status token out, matching `ValidityDecoder::default_tokens`.
pub async fn spawn_padding_server(service: CbcHmacService) -> SocketAddr {
    let service = Arc::new(service);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("could not bind sim tcp server");
    let addr = listener.local_addr().expect("listener has a local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let token = match hex::decode(line.trim()) {
                        Ok(wire) => status_token(service.classify(&wire)),
                        Err(_) => "length_error",
                    };
                    if writer.write_all(format!("{token}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn status_token(validity: Validity) -> &'static str {
    match validity {
        Validity::Ok => "valid",
        Validity::PaddingInvalid => "padding_error",
        Validity::AuthInvalid => "mac_error",
        Validity::LengthInvalid => "length_error",
    }
}
