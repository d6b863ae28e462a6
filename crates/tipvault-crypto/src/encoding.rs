//! Base64 at the storage boundary

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{CryptoError, CryptoResult};

pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn base64_decode(s: &str) -> CryptoResult<Vec<u8>> {
    STANDARD
        .decode(s)
        .map_err(|e| CryptoError::Malformed(format!("base64 decode: {e}")))
}

/// `#[serde(with = "base64_bytes")]` for `Vec<u8>` fields
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::base64_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::base64_decode(&s).map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "base64_salt")]` for fixed-size salts
pub mod base64_salt {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::SALT_SIZE;

    pub fn serialize<S: Serializer>(
        salt: &[u8; SALT_SIZE],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::base64_encode(salt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; SALT_SIZE], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = super::base64_decode(&s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::custom(format!(
                "salt has wrong size: {} bytes (expected {SALT_SIZE})",
                v.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Record {
        #[serde(with = "base64_bytes")]
        blob: Vec<u8>,
        #[serde(with = "base64_salt")]
        salt: [u8; crate::SALT_SIZE],
    }

    #[test]
    fn test_fields_are_base64_text() {
        let rec = Record {
            blob: b"\x00\x01binary".to_vec(),
            salt: [0xAB; crate::SALT_SIZE],
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains(&base64_encode(b"\x00\x01binary")));

        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back.blob, rec.blob);
        assert_eq!(back.salt, rec.salt);
    }

    #[test]
    fn test_short_salt_rejected() {
        let json = format!(r#"{{"blob":"","salt":"{}"}}"#, base64_encode(&[1, 2, 3]));
        assert!(serde_json::from_str::<Record>(&json).is_err());
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(
            base64_decode("not base64!!"),
            Err(CryptoError::Malformed(_))
        ));
    }
}
