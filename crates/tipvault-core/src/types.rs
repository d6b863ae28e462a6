use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh random (UUID v4) identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(
    /// Stable identifier of a user record
    UserId
);

opaque_id!(
    /// Identifier of a submission (internal tip)
    TipId
);

opaque_id!(
    /// Identifier of an authenticated session. Never persisted.
    SessionId
);

/// Receivers are users; the alias documents which role an id plays.
pub type ReceiverId = UserId;

/// Per-tenant switches that influence key management
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    /// Tenant-wide encryption: users get keypairs and submissions get tip keys
    pub encryption: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(UserId::generate(), UserId::generate());
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            tip: TipId,
        }

        let encoded = toml::to_string(&Holder { tip: TipId::from("tip-1") }).unwrap();
        assert_eq!(encoded.trim(), "tip = \"tip-1\"");

        let decoded: Holder = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.tip.as_str(), "tip-1");
    }
}
