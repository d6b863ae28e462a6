use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Authentication tag mismatch, wrong key, or truncated ciphertext.
    /// No plaintext is ever returned alongside this error.
    #[error("authenticated decryption failed: wrong key or corrupted data")]
    Decrypt,

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),
}
