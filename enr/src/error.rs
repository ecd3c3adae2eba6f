use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrError {
    #[error("encoded record exceeds the maximum ENR size")]
    ExceedsMaxSize,
    #[error("failed to sign ENR record")]
    SigningError,
    #[error("ENR record signature is invalid")]
    InvalidSignature,
    #[error("ENR record is missing the secp256k1 public key entry")]
    MissingPublicKey,
    #[error("ENR record public key could not be parsed: {0}")]
    InvalidPublicKey(String),
    #[error("RLP decode error: {0}")]
    Rlp(#[from] rlp::DecoderError),
    #[error("protocol-versions (`pv`) entry exceeds the maximum length of 8")]
    TooManyVersions,
}
