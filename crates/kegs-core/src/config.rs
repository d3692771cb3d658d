use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KegError, KegResult};

/// Top-level configuration (loaded from kegs.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KegsConfig {
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub files: FilesConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl KegsConfig {
    /// Read and parse a TOML config file; a missing file yields defaults.
    pub fn load(path: &Path) -> KegResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| KegError::Config(format!("reading config {}: {e}", path.display())))?;
        let config: KegsConfig = toml::from_str(&content)
            .map_err(|e| KegError::Config(format!("parsing config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KegResult<()> {
        if self.download.parallelism == 0 || self.upload.parallelism == 0 {
            return Err(KegError::Config("parallelism must be at least 1".into()));
        }
        if self.upload.queue_parallelism == 0 {
            return Err(KegError::Config("upload.queue_parallelism must be at least 1".into()));
        }
        if self.files.chunk_size == 0 {
            return Err(KegError::Config("files.chunk_size must be non-zero".into()));
        }
        if self.download.max_download_chunk_size < self.files.chunk_size + self.files.chunk_overhead {
            return Err(KegError::Config(
                "download.max_download_chunk_size must hold at least one chunk with overhead".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum concurrent byte-range fetches
    pub parallelism: usize,
    /// Upper bound for one fetch; rounded down to whole chunks
    pub max_download_chunk_size: u64,
    /// Per-slot budget of fetched-but-undecrypted bytes
    pub max_decrypt_buffer_size: u64,
    /// Attempts per fetch before giving up
    pub max_fetch_attempts: u32,
    pub fetch_retry_delay_ms: u64,
}

impl DownloadConfig {
    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum concurrent chunk uploads
    pub parallelism: usize,
    /// Per-slot budget of encrypted-but-unsent bytes
    pub max_encrypt_buffer_size: u64,
    /// How many whole-file uploads may run at once
    pub queue_parallelism: usize,
    pub max_upload_attempts: u32,
    pub upload_retry_delay_ms: u64,
}

impl UploadConfig {
    pub fn upload_retry_delay(&self) -> Duration {
        Duration::from_millis(self.upload_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Plaintext bytes per chunk
    pub chunk_size: u64,
    /// AEAD tag bytes added to every chunk
    pub chunk_overhead: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Fixed delay between attempts of `retry_until_success`
    pub delay_ms: u64,
    /// Attempts per keyed retry before giving up (0 = retry until success)
    pub max_attempts: u32,
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn attempt_limit(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding resume descriptors
    pub resume_db: PathBuf,
}

impl StorageConfig {
    /// `resume_db` with a leading `~/` expanded to the home directory.
    pub fn resume_db_path(&self) -> PathBuf {
        expand_tilde(&self.resume_db)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            max_download_chunk_size: 2 * 1024 * 1024,
            max_decrypt_buffer_size: 2 * 1024 * 1024,
            max_fetch_attempts: 5,
            fetch_retry_delay_ms: 3000,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            max_encrypt_buffer_size: 2 * 1024 * 1024,
            queue_parallelism: 1,
            max_upload_attempts: 5,
            upload_retry_delay_ms: 3000,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512 * 1024,
            chunk_overhead: 16,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_ms: 3000,
            max_attempts: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resume_db: PathBuf::from("~/.local/share/kegs/resume.json"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[download]
parallelism = 4
max_download_chunk_size = 1048576
max_decrypt_buffer_size = 524288
max_fetch_attempts = 3
fetch_retry_delay_ms = 100

[upload]
parallelism = 3
queue_parallelism = 2

[files]
chunk_size = 65520
chunk_overhead = 16

[retry]
delay_ms = 250
max_attempts = 4

[storage]
resume_db = "/var/lib/kegs/resume.json"

[log]
level = "debug"
format = "json"
"#;
        let config: KegsConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.download.parallelism, 4);
        assert_eq!(config.download.max_fetch_attempts, 3);
        assert_eq!(config.download.fetch_retry_delay(), Duration::from_millis(100));
        assert_eq!(config.upload.parallelism, 3);
        assert_eq!(config.upload.queue_parallelism, 2);
        assert_eq!(config.files.chunk_size, 65520);
        assert_eq!(config.retry.delay(), Duration::from_millis(250));
        assert_eq!(config.retry.attempt_limit(), Some(4));
        assert_eq!(config.storage.resume_db, PathBuf::from("/var/lib/kegs/resume.json"));
        assert_eq!(config.log.format, "json");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config: KegsConfig = toml::from_str("").unwrap();

        assert_eq!(config.download.parallelism, 2);
        assert_eq!(config.download.max_fetch_attempts, 5);
        assert_eq!(config.upload.queue_parallelism, 1);
        assert_eq!(config.files.chunk_overhead, 16);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.retry.attempt_limit(), None);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[download]
parallelism = 8
"#;
        let config: KegsConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.download.parallelism, 8);
        // Defaults
        assert_eq!(config.download.max_download_chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.files.chunk_size, 512 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let mut config = KegsConfig::default();
        config.download.parallelism = 0;
        assert!(matches!(config.validate(), Err(KegError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_tiny_batch() {
        let mut config = KegsConfig::default();
        config.download.max_download_chunk_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = KegsConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.download.parallelism, 2);
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("kegs.toml");
        std::fs::write(&path, "[upload]\nparallelism = 6\n").unwrap();
        let config = KegsConfig::load(&path).unwrap();
        assert_eq!(config.upload.parallelism, 6);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = KegsConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: KegsConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.download.parallelism, parsed.download.parallelism);
        assert_eq!(config.files.chunk_size, parsed.files.chunk_size);
        assert_eq!(config.storage.resume_db, parsed.storage.resume_db);
    }

    #[test]
    fn test_resume_db_tilde_expansion() {
        let storage = StorageConfig {
            resume_db: PathBuf::from("/abs/resume.json"),
        };
        assert_eq!(storage.resume_db_path(), PathBuf::from("/abs/resume.json"));

        let default = StorageConfig::default().resume_db_path();
        assert!(!default.to_string_lossy().starts_with('~'));
        assert!(default.ends_with(".local/share/kegs/resume.json"));
    }
}
