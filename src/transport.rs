// Oracle adapters over the two transports found in the wild: a line-oriented
// socket protocol (hex ciphertext + newline, text status back) and an
// HTTP+JSON endpoint whose response length is the leak. Each adapter turns
// raw responses into a `Signal` before the engine sees anything.
use std::future::Future;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::TransportError;
use crate::oracle::{MagnitudeOracle, ValidityOracle};
use crate::signal::{Magnitude, Validity, ValidityDecoder};

/// Padding oracle behind a TCP line protocol. One connection per query keeps
/// the adapter stateless and lets the retry layer reconnect for free.
pub struct SocketOracle {
    addr: String,
    decoder: ValidityDecoder,
    skip_banner: bool,
}

impl SocketOracle {
    pub fn new(addr: impl Into<String>, decoder: ValidityDecoder) -> Self {
        Self {
            addr: addr.into(),
            decoder,
            skip_banner: false,
        }
    }

    /// Some deployments greet each connection with a banner line before
    /// accepting queries; skip it.
    pub fn with_banner(mut self) -> Self {
        self.skip_banner = true;
        self
    }
}

impl ValidityOracle for SocketOracle {
    fn query(
        &self,
        ciphertext: &[u8],
    ) -> impl Future<Output = Result<Validity, TransportError>> + Send {
        async move {
            let stream = TcpStream::connect(&self.addr).await?;
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            if self.skip_banner {
                let mut banner = String::new();
                reader.read_line(&mut banner).await?;
            }

            let line = format!("{}\n", hex::encode(ciphertext));
            let started = Instant::now();
            writer.write_all(line.as_bytes()).await?;

            let mut response = String::new();
            let n = reader.read_line(&mut response).await?;
            if n == 0 {
                return Err(TransportError::Protocol(
                    "oracle closed the connection without answering".into(),
                ));
            }
            self.decoder.decode(&response, started.elapsed())
        }
    }
}

#[derive(Debug, Serialize)]
struct ProbeRequest<'a> {
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    ciphertext: String,
}

/// Compression oracle behind `POST {"data": ...}`; the magnitude is the
/// decoded byte length of the returned ciphertext.
pub struct HttpOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpOracle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl MagnitudeOracle for HttpOracle {
    fn query(&self, payload: &[u8]) -> impl Future<Output = Result<Magnitude, TransportError>> + Send {
        async move {
            let data = std::str::from_utf8(payload).map_err(|_| {
                TransportError::Protocol("probe payload is not valid utf-8".into())
            })?;
            let response = self
                .client
                .post(&self.url)
                .json(&ProbeRequest { data })
                .send()
                .await?;
            let body: ProbeResponse = response.json().await?;
            let raw = BASE64.decode(body.ciphertext.trim()).map_err(|err| {
                TransportError::Protocol(format!("ciphertext is not valid base64: {err}"))
            })?;
            Ok(Magnitude(raw.len() as u64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bundle::CipherBundle;
    use crate::decrypt::decrypt;
    use crate::extract::{extract, ExtractConfig};
    use crate::oracle::QueryPolicy;
    use crate::session::CancelFlag;
    use crate::sim::{
        random_bytes_with_seed, spawn_compression_server, spawn_padding_server, CbcHmacService,
        DeflateService,
    };

    fn test_policy() -> QueryPolicy {
        QueryPolicy {
            timeout: std::time::Duration::from_secs(5),
            max_retries: 2,
            backoff: std::time::Duration::from_millis(1),
            sweep_width: 16,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn socket_oracle_decrypts_over_the_line_protocol() {
        let plaintext = b"the wire and the engine agree on every token";
        let mut service = CbcHmacService::new(
            random_bytes_with_seed::<16>(21),
            random_bytes_with_seed::<32>(22),
        );
        let wire = service.encrypt(plaintext, random_bytes_with_seed::<16>(23));
        let bundle = CipherBundle::parse(&wire).unwrap();
        let addr = spawn_padding_server(service).await;
        let oracle = SocketOracle::new(addr.to_string(), ValidityDecoder::default_tokens());

        let recovery = decrypt(&bundle, &oracle, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(recovery.plaintext, plaintext);
        assert!(recovery.unresolved.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_oracle_reports_decoded_ciphertext_length() {
        let secret = b"csawctf{http_l3n}";
        let url = spawn_compression_server(secret).await;
        let oracle = HttpOracle::new(url);
        let expected = DeflateService::new(secret).record_len(b"probe");

        let magnitude = oracle.query(b"probe").await.unwrap();

        assert_eq!(magnitude, Magnitude(expected));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_oracle_extracts_the_planted_secret() {
        // 'a' at offset 10 keeps the one length-code boundary round safe
        // under byte-rounding ties.
        let secret = b"csawctf{leak_l3n5}";
        let url = spawn_compression_server(secret).await;
        let oracle = HttpOracle::new(url);
        let config = ExtractConfig::default();

        let extraction = extract(&oracle, &config, &test_policy(), &CancelFlag::new())
            .await
            .unwrap();

        assert!(extraction.complete);
        assert_eq!(extraction.recovered, secret);
    }

    #[tokio::test]
    async fn unreachable_socket_is_a_transport_error() {
        // Port 9 on localhost is the discard service; nothing listens there
        // in the test environment.
        let oracle = SocketOracle::new("127.0.0.1:9", ValidityDecoder::default_tokens());

        let result = oracle.query(&[0u8; 96]).await;

        assert!(result.is_err());
    }
}
