//! tipvault-crypto: primitives behind the submission confidentiality engine
//!
//! Key hierarchy:
//! ```text
//! User password ──Argon2id──► login hash            (verification only)
//!               ──Argon2id──► wrapping key (domain-separated salt)
//!                                └── XChaCha20-Poly1305 wrap of the user private key
//! Recovery key (256-bit, BIP-39 words) ──HKDF──► recovery wrapping key
//!                                └── XChaCha20-Poly1305 wrap of the user private key
//! User keypair (age X25519)
//!   ├── sealed: recovery key, two-factor seed          (SecretFieldCodec)
//!   └── sealed: tip private key, one copy per receiver (fan-out)
//! Tip keypair (age X25519)
//!   └── sealed: preview, answers, attachment metadata
//! ```
//!
//! Every binary value crosses the storage boundary as base64 text.

pub mod asymmetric;
pub mod codec;
pub mod encoding;
pub mod error;
pub mod kdf;
pub mod password;
pub mod random;
pub mod recovery;
pub mod symmetric;

pub use asymmetric::{
    asymmetric_decrypt, asymmetric_encrypt, generate_keypair, KeyPair, PrivateKey, PublicKey,
};
pub use codec::{
    unwrap_under_private_key, unwrap_under_symmetric_key, wrap_under_public_key,
    wrap_under_symmetric_key, KeyReference, WrappedKey,
};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_key, KdfParams, WrappingKey};
pub use password::{hash_password, verify_password, PasswordHash};
pub use random::{generate_salt, random_base32, random_bytes};
pub use recovery::RecoveryKey;
pub use symmetric::{symmetric_decrypt, symmetric_encrypt};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a password salt in bytes
pub const SALT_SIZE: usize = 16;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
