//! Configuration for the sfs3 transfer engine.
//!
//! Sources, later overriding earlier: the YAML file at `~/.sfs3.conf`
//! (or the `-C` path), `SFS3_<KEY>` environment variables, then
//! `AWS_ACCESS_KEY` / `AWS_SECRET_KEY`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// AWS access key id
    #[serde(default)]
    pub access_key: Option<String>,

    /// AWS secret access key
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Target bucket, optionally with a key prefix: `<bucket>[/<prefix>]`
    #[serde(default)]
    pub bucket: Option<String>,

    /// Use HTTPS for the AWS endpoint
    #[serde(default = "default_ssl")]
    pub ssl: bool,

    /// GPG recipient for encrypted uploads
    #[serde(default)]
    pub crypto_keyid: Option<String>,

    /// Custom endpoint URL (MinIO, LocalStack, other S3-compatibles)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Path-style URLs (required for MinIO, LocalStack)
    #[serde(default)]
    pub force_path_style: bool,

    /// Multipart part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Bulk-run worker count and per-upload part concurrency
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,

    /// HTTP connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Streaming inactivity timeout in seconds
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout: u64,

    /// Retry budget per transfer
    #[serde(default = "default_retries")]
    pub retries: u32,
}

// Default value functions for serde
fn default_ssl() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_part_size() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_concurrent() -> usize {
    4
}

fn default_timeout() -> u64 {
    10
}

fn default_stall_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            bucket: None,
            ssl: default_ssl(),
            crypto_keyid: None,
            endpoint: None,
            region: default_region(),
            force_path_style: false,
            part_size: default_part_size(),
            concurrent: default_concurrent(),
            timeout: default_timeout(),
            stall_timeout: default_stall_timeout(),
            retries: default_retries(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Default config file location: `~/.sfs3.conf`.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".sfs3.conf"))
    }

    /// Load from `path` (or the default location when it exists), then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides: `SFS3_<KEY>` first, then the bare AWS pair.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SFS3_ACCESS_KEY") {
            self.access_key = Some(v);
        }
        if let Ok(v) = std::env::var("SFS3_SECRET_KEY") {
            self.secret_key = Some(v);
        }
        if let Ok(v) = std::env::var("SFS3_BUCKET") {
            self.bucket = Some(v);
        }
        if let Ok(v) = std::env::var("SFS3_SSL") {
            self.ssl = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SFS3_CRYPTO_KEYID") {
            self.crypto_keyid = Some(v);
        }
        if let Ok(v) = std::env::var("SFS3_ENDPOINT") {
            self.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("SFS3_REGION") {
            self.region = v;
        }
        if let Ok(v) = std::env::var("AWS_ACCESS_KEY") {
            self.access_key = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_SECRET_KEY") {
            self.secret_key = Some(v);
        }
    }

    /// Split the `bucket` value into `(bucket, prefix)`. The prefix is empty
    /// when the value names a bare bucket.
    pub fn bucket_and_prefix(&self) -> Result<(String, String)> {
        let raw = self
            .bucket
            .as_deref()
            .ok_or_else(|| Error::Config("no bucket configured".to_string()))?;
        let raw = raw.trim_matches('/');
        if raw.is_empty() {
            return Err(Error::Config("no bucket configured".to_string()));
        }
        Ok(match raw.split_once('/') {
            Some((bucket, prefix)) => (bucket.to_string(), prefix.to_string()),
            None => (raw.to_string(), String::new()),
        })
    }

    /// Reject configurations that cannot authenticate. Fatal before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.access_key.as_deref().unwrap_or("").is_empty() {
            return Err(Error::Config("no access_key configured".to_string()));
        }
        if self.secret_key.as_deref().unwrap_or("").is_empty() {
            return Err(Error::Config("no secret_key configured".to_string()));
        }
        self.bucket_and_prefix().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.ssl);
        assert_eq!(config.part_size, 100 * 1024 * 1024);
        assert_eq!(config.concurrent, 4);
        assert_eq!(config.stall_timeout, 30);
        assert_eq!(config.retries, 3);
    }

    #[test]
    fn test_config_parse_yaml() {
        let yaml = r#"
            access_key: AKIAEXAMPLE
            secret_key: sekrit
            bucket: backups/prod
            ssl: false
            crypto_keyid: 0xDEADBEEF
        "#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.access_key.as_deref(), Some("AKIAEXAMPLE"));
        assert!(!config.ssl);
        assert_eq!(config.crypto_keyid.as_deref(), Some("0xDEADBEEF"));
        assert_eq!(config.region, "us-east-1");

        let (bucket, prefix) = config.bucket_and_prefix().unwrap();
        assert_eq!(bucket, "backups");
        assert_eq!(prefix, "prod");
    }

    #[test]
    fn test_bucket_without_prefix() {
        let config = Config {
            bucket: Some("plain".to_string()),
            ..Config::default()
        };
        let (bucket, prefix) = config.bucket_and_prefix().unwrap();
        assert_eq!(bucket, "plain");
        assert_eq!(prefix, "");
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let config = Config {
            bucket: Some("b".to_string()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_missing_bucket() {
        let config = Config {
            access_key: Some("a".to_string()),
            secret_key: Some("s".to_string()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
