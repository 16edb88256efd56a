//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. the `--config` command-line argument
//! 2. `$DMARC_HARVEST_CONFIG` (environment variable)
//! 3. `~/.config/dmarc-harvest/config.toml` (Linux/macOS)
//!    `%APPDATA%\dmarc-harvest\config.toml` (Windows)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};
use crate::mailbox::DEFAULT_MAILBOX;
use crate::parser::mime::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_PARTS};
use crate::parser::report::DEFAULT_MAX_REPORT_SIZE;

/// Port used when `imap.server` does not name one (IMAP over TLS).
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub general: GeneralConfig,
    /// Mailbox account.
    pub imap: ImapConfig,
    /// Where the cursor document lives.
    pub cursor: CursorConfig,
    /// Fetch and decoding limits.
    pub pipeline: PipelineConfig,
    /// Where decoded reports are written.
    pub output: OutputConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Prefix log lines with a timestamp.
    pub log_datetime: bool,
    /// Override the directory for the log file.
    pub log_dir: Option<PathBuf>,
}

/// Mailbox account settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    /// `host` or `host:port`.
    pub server: String,
    pub username: String,
    pub password: String,
    /// Mailbox to harvest.
    pub mailbox: String,
    pub connect_timeout_secs: u64,
    /// Deadline for select and for each fetched message.
    pub read_timeout_secs: u64,
    /// Accept self-signed or otherwise invalid server certificates.
    pub accept_invalid_certs: bool,
}

/// Cursor document location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Override the cursor file path.
    pub path: Option<PathBuf>,
}

/// Fetch and decoding limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Messages buffered between the fetch task and the extractor.
    pub queue_capacity: usize,
    /// Leaf parts walked per message before giving up on it.
    pub max_parts: usize,
    /// Multipart nesting walked per message before giving up on it.
    pub max_depth: usize,
    /// Largest decompressed report accepted, in bytes.
    pub max_report_size: u64,
    /// Treat every attachment as gzip-compressed.
    pub compressed_hint: bool,
}

/// Report output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Write each decoded report as JSON into this directory.
    pub dir: Option<PathBuf>,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_datetime: true,
            log_dir: None,
        }
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: String::new(),
            password: String::new(),
            mailbox: DEFAULT_MAILBOX.to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            accept_invalid_certs: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            max_parts: DEFAULT_MAX_PARTS,
            max_depth: DEFAULT_MAX_DEPTH,
            max_report_size: DEFAULT_MAX_REPORT_SIZE,
            compressed_hint: false,
        }
    }
}

// Keeps the password out of debug logs.
impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mailbox", &self.mailbox)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

impl ImapConfig {
    /// Split `server` into host and port, defaulting the port to 993.
    pub fn host_and_port(&self) -> Result<(String, u16)> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err(HarvestError::Config("imap.server is not set".into()));
        }
        match server.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| {
                    HarvestError::Config(format!("invalid port in imap.server '{server}'"))
                })?;
                Ok((host.to_string(), port))
            }
            _ => Ok((server.to_string(), DEFAULT_IMAP_PORT)),
        }
    }

    /// Mailbox name, falling back to `inbox` when left empty.
    pub fn mailbox_name(&self) -> &str {
        if self.mailbox.trim().is_empty() {
            DEFAULT_MAILBOX
        } else {
            &self.mailbox
        }
    }

    /// Key under which this account's cursor is stored.
    pub fn mailbox_id(&self) -> String {
        format!(
            "{}@{}/{}",
            self.username,
            self.server.trim(),
            self.mailbox_name()
        )
    }
}

impl Config {
    /// Reject settings the run cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.imap.host_and_port()?;
        if self.imap.username.trim().is_empty() {
            return Err(HarvestError::Config("imap.username is not set".into()));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(HarvestError::Config(
                "pipeline.queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration from `explicit` or the standard locations.
///
/// An explicitly named file must exist. When no file is found at the
/// standard locations the built-in defaults are returned.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match config_file_path() {
            Some(p) if p.exists() => p,
            _ => {
                tracing::debug!("No config file found, using defaults");
                return Ok(Config::default());
            }
        },
    };

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| HarvestError::Config(format!("cannot read '{}': {e}", path.display())))?;
    let cfg = toml::from_str::<Config>(&contents)
        .map_err(|e| HarvestError::Config(format!("cannot parse '{}': {e}", path.display())))?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(cfg)
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    // 1. Environment variable override
    if let Ok(env_path) = std::env::var("DMARC_HARVEST_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    // 2. Standard config directory
    dirs::config_dir().map(|d| d.join("dmarc-harvest").join("config.toml"))
}

/// Return the cursor document path.
pub fn cursor_file_path(config: &Config) -> PathBuf {
    if let Some(ref path) = config.cursor.path {
        return path.clone();
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dmarc-harvest")
        .join("cursors.json")
}

/// Return the directory for the log file.
pub fn log_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.log_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dmarc-harvest")
}
