// Adaptive side-channel extraction: recover plaintext from an oracle that
// leaks one bit (padding validity) or one scalar (compressed length) per
// query, without ever touching the key.
pub mod block;
pub mod bundle;
pub mod decrypt;
pub mod error;
pub mod extract;
pub mod oracle;
pub mod session;
pub mod signal;
pub mod sim;
pub mod transport;

pub use block::{pkcs7_pad, pkcs7_unpad, split_blocks, Block, PaddingError, BLOCK_SIZE};
pub use bundle::{CipherBundle, MAC_SIZE};
pub use decrypt::{decrypt, Recovery};
pub use error::{ExtractionError, TransportError};
pub use extract::{extract, ExtractConfig, Extraction};
pub use oracle::{MagnitudeOracle, QueryPolicy, ValidityOracle};
pub use session::{AttackTrace, CancelFlag, Completion, Decision, Session, SessionReport};
pub use signal::{Magnitude, Validity, ValidityDecoder};
pub use transport::{HttpOracle, SocketOracle};
