use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::TenantSettings;

/// Top-level configuration (loaded from tipvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TipvaultConfig {
    pub daemon: DaemonConfig,
    pub tenant: TenantConfig,
    pub crypto: CryptoConfig,
    pub session: SessionConfig,
    pub workers: WorkerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Display name of the tenant
    pub name: String,
    /// Tenant-wide encryption (default: true)
    pub encryption: bool,
}

impl TenantConfig {
    pub fn settings(&self) -> TenantSettings {
        TenantSettings {
            encryption: self.encryption,
        }
    }
}

/// Argon2id cost parameters, shared by the login hash and the wrapping KDF
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of an unwrapped key in the session cache (default: 3600)
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum concurrent KDF jobs (0 = cpu_count)
    pub kdf_workers: usize,
}

impl WorkerConfig {
    pub fn effective_kdf_workers(&self) -> usize {
        if self.kdf_workers > 0 {
            return self.kdf_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON record store path
    pub path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            encryption: true,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/tipvault/records.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
log_format = "json"

[tenant]
name = "newsroom"
encryption = false

[crypto]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8

[session]
ttl_secs = 900

[workers]
kdf_workers = 2

[storage]
path = "/var/lib/tipvault/records.json"
"#;
        let config: TipvaultConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(config.tenant.name, "newsroom");
        assert!(!config.tenant.encryption);
        assert!(!config.tenant.settings().encryption);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.crypto.argon2_parallelism, 8);
        assert_eq!(config.session.ttl_secs, 900);
        assert_eq!(config.workers.effective_kdf_workers(), 2);
        assert_eq!(
            config.storage.path,
            PathBuf::from("/var/lib/tipvault/records.json")
        );
    }

    #[test]
    fn test_parse_defaults() {
        let config: TipvaultConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.tenant.encryption);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 65536);
        assert_eq!(config.crypto.argon2_time_cost, 3);
        assert_eq!(config.session.ttl_secs, 3600);
        assert_eq!(config.workers.kdf_workers, 0);
        assert!(config.workers.effective_kdf_workers() >= 1);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[session]
ttl_secs = 60
"#;
        let config: TipvaultConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.session.ttl_secs, 60);
        // Defaults
        assert!(config.tenant.encryption);
        assert_eq!(config.crypto.argon2_time_cost, 3);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = TipvaultConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: TipvaultConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.path, parsed.storage.path);
        assert_eq!(config.session.ttl_secs, parsed.session.ttl_secs);
        assert_eq!(config.tenant.encryption, parsed.tenant.encryption);
    }
}
