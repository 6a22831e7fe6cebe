//! Coinshuffle Configuration
//!
//! Shared configuration crate for the shuffling engine and the devnet.
//!
//! Handles loading configuration from:
//! 1. CS_CONFIG env var (explicit path)
//! 2. ./config.toml (current directory)
//! 3. ~/.coinshuffle/config.toml (user home)
//!
//! Environment variables take precedence over TOML config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::{env, fs};

/// Global config instance for convenience access
pub static GLOBAL_CONFIG: OnceLock<ShuffleConfig> = OnceLock::new();

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_NAME: &str = ".coinshuffle";

// ============================================================================
// Default Constants
// ============================================================================

/// 1000 coins in base units.
const DEFAULT_DEPOSIT: i64 = 1000 * 100_000_000;
const DEFAULT_PROCESSING_DEADLINE: u16 = 100;
const DEFAULT_MAX_REGISTRATION_PERIOD: u16 = 1440;
const DEFAULT_MIN_PARTICIPANTS: u8 = 3;
const DEFAULT_MAX_PARTICIPANTS: u8 = 30;

const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 255 * 176;
const DEFAULT_MIN_TRANSACTION_SIZE: usize = 176;
const DEFAULT_MAX_TRANSACTIONS_PER_BLOCK: usize = 255;
// Largest processing message observed for 30 participants was just under this.
const DEFAULT_NON_REGISTRATION_TX_SIZE: usize = 16384;

const DEFAULT_DB_PATH: &str = "./coinshuffle-db";

const DEFAULT_BLOCK_INTERVAL_MS: u64 = 200;
const DEFAULT_DEVNET_PARTICIPANTS: u8 = 3;
const DEFAULT_DEVNET_AMOUNT: i64 = 2000 * 100_000_000;
const DEFAULT_DEVNET_MAX_BLOCKS: u64 = 500;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShuffleConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub limits: BlockLimits,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub devnet: DevnetConfig,
}

/// What happens to a shuffling's rows once it is DONE or CANCELLED.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Keep,
    /// Tombstone the rows at the terminal height; older heights stay readable.
    DeleteFinished,
}

/// Protocol parameters every node must agree on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Stake per participant, in coin base units.
    #[serde(default = "default_deposit")]
    pub deposit: i64,
    /// Blocks a processor has for its turn.
    #[serde(default = "default_processing_deadline")]
    pub processing_deadline: u16,
    #[serde(default = "default_max_registration_period")]
    pub max_registration_period: u16,
    #[serde(default = "default_min_participants")]
    pub min_participants: u8,
    #[serde(default = "default_max_participants")]
    pub max_participants: u8,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            deposit: DEFAULT_DEPOSIT,
            processing_deadline: DEFAULT_PROCESSING_DEADLINE,
            max_registration_period: DEFAULT_MAX_REGISTRATION_PERIOD,
            min_participants: DEFAULT_MIN_PARTICIPANTS,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            retention: RetentionPolicy::Keep,
        }
    }
}

impl ProtocolConfig {
    /// Deadline for VERIFICATION and BLAME.
    pub fn verification_deadline(&self, participant_count: u8) -> u16 {
        self.processing_deadline
            .saturating_add(u16::from(participant_count))
    }
}

fn default_deposit() -> i64 {
    DEFAULT_DEPOSIT
}
fn default_processing_deadline() -> u16 {
    DEFAULT_PROCESSING_DEADLINE
}
fn default_max_registration_period() -> u16 {
    DEFAULT_MAX_REGISTRATION_PERIOD
}
fn default_min_participants() -> u8 {
    DEFAULT_MIN_PARTICIPANTS
}
fn default_max_participants() -> u8 {
    DEFAULT_MAX_PARTICIPANTS
}

/// Per-block payload budget used by the deadline monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLimits {
    #[serde(default = "default_max_payload_length")]
    pub max_payload_length: usize,
    #[serde(default = "default_min_transaction_size")]
    pub min_transaction_size: usize,
    #[serde(default = "default_max_transactions_per_block")]
    pub max_transactions_per_block: usize,
    /// Room reserved for a PROCESSING/VERIFICATION/BLAME message.
    #[serde(default = "default_non_registration_tx_size")]
    pub non_registration_tx_size: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            min_transaction_size: DEFAULT_MIN_TRANSACTION_SIZE,
            max_transactions_per_block: DEFAULT_MAX_TRANSACTIONS_PER_BLOCK,
            non_registration_tx_size: DEFAULT_NON_REGISTRATION_TX_SIZE,
        }
    }
}

fn default_max_payload_length() -> usize {
    DEFAULT_MAX_PAYLOAD_LENGTH
}
fn default_min_transaction_size() -> usize {
    DEFAULT_MIN_TRANSACTION_SIZE
}
fn default_max_transactions_per_block() -> usize {
    DEFAULT_MAX_TRANSACTIONS_PER_BLOCK
}
fn default_non_registration_tx_size() -> usize {
    DEFAULT_NON_REGISTRATION_TX_SIZE
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Rocksdb,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Discard the stored chain on startup instead of resuming from its tip.
    #[serde(default)]
    pub reset_on_start: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: DEFAULT_DB_PATH.into(),
            reset_on_start: false,
        }
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.into()
}

/// Local single-process network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevnetConfig {
    #[serde(default = "default_block_interval")]
    pub block_interval_ms: u64,
    #[serde(default = "default_devnet_participants")]
    pub participants: u8,
    #[serde(default = "default_devnet_amount")]
    pub amount: i64,
    #[serde(default = "default_devnet_max_blocks")]
    pub max_blocks: u64,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: DEFAULT_BLOCK_INTERVAL_MS,
            participants: DEFAULT_DEVNET_PARTICIPANTS,
            amount: DEFAULT_DEVNET_AMOUNT,
            max_blocks: DEFAULT_DEVNET_MAX_BLOCKS,
        }
    }
}

fn default_block_interval() -> u64 {
    DEFAULT_BLOCK_INTERVAL_MS
}
fn default_devnet_participants() -> u8 {
    DEFAULT_DEVNET_PARTICIPANTS
}
fn default_devnet_amount() -> i64 {
    DEFAULT_DEVNET_AMOUNT
}
fn default_devnet_max_blocks() -> u64 {
    DEFAULT_DEVNET_MAX_BLOCKS
}

// ============================================================================
// Env Helpers
// ============================================================================

/// Set field from env var if present
fn env_string(key: &str, field: &mut String) {
    if let Ok(v) = env::var(key) {
        *field = v;
    }
}

/// Set field from env var if present and parseable
fn env_parse<T: std::str::FromStr>(key: &str, field: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

/// Check if env var is set to a truthy value ("1" or "true")
fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

// ============================================================================
// Implementation
// ============================================================================

impl ShuffleConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => {
                log::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        // 1. Check CS_CONFIG env var
        if let Ok(path) = env::var("CS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 2. Check ./config.toml (current directory)
        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        // 3. Check ~/.coinshuffle/config.toml
        dirs::home_dir()
            .map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .filter(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Protocol
        env_parse("CS_DEPOSIT", &mut self.protocol.deposit);
        env_parse(
            "CS_PROCESSING_DEADLINE",
            &mut self.protocol.processing_deadline,
        );
        env_parse(
            "CS_MAX_REGISTRATION_PERIOD",
            &mut self.protocol.max_registration_period,
        );
        env_parse("CS_MIN_PARTICIPANTS", &mut self.protocol.min_participants);
        env_parse("CS_MAX_PARTICIPANTS", &mut self.protocol.max_participants);
        if let Some(delete) = env_bool("CS_DELETE_FINISHED") {
            self.protocol.retention = if delete {
                RetentionPolicy::DeleteFinished
            } else {
                RetentionPolicy::Keep
            };
        }

        // Limits
        env_parse("CS_MAX_PAYLOAD_LENGTH", &mut self.limits.max_payload_length);
        env_parse(
            "CS_NON_REGISTRATION_TX_SIZE",
            &mut self.limits.non_registration_tx_size,
        );

        // Database
        env_string("CS_DB_PATH", &mut self.database.path);
        if let Some(reset) = env_bool("CS_DB_RESET") {
            self.database.reset_on_start = reset;
        }
        if let Ok(v) = env::var("CS_DB_BACKEND") {
            self.database.backend = match v.to_ascii_lowercase().as_str() {
                "rocksdb" => StorageBackend::Rocksdb,
                _ => StorageBackend::Memory,
            };
        }

        // Devnet
        env_parse("CS_BLOCK_INTERVAL_MS", &mut self.devnet.block_interval_ms);
        env_parse("CS_DEVNET_PARTICIPANTS", &mut self.devnet.participants);
        env_parse("CS_DEVNET_AMOUNT", &mut self.devnet.amount);
        env_parse("CS_DEVNET_MAX_BLOCKS", &mut self.devnet.max_blocks);
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        let mut sample = Self::default();
        sample.database.backend = StorageBackend::Rocksdb;
        toml::to_string_pretty(&sample).unwrap_or_default()
    }

    /// Get the global config instance, initializing it if necessary.
    ///
    /// Falls back to defaults if loading fails.
    pub fn global() -> &'static ShuffleConfig {
        GLOBAL_CONFIG.get_or_init(|| {
            Self::load().unwrap_or_else(|e| {
                log::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            })
        })
    }

    /// Initialize the global config with a specific instance.
    ///
    /// Returns `Err(config)` if already initialized.
    pub fn set_global(config: ShuffleConfig) -> Result<(), ShuffleConfig> {
        GLOBAL_CONFIG.set(config)
    }
}

/// Shorthand for `ShuffleConfig::global()`.
#[inline]
pub fn global_config() -> &'static ShuffleConfig {
    ShuffleConfig::global()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ShuffleConfig::default();
        assert_eq!(config.protocol.deposit, DEFAULT_DEPOSIT);
        assert_eq!(config.protocol.processing_deadline, 100);
        assert_eq!(config.protocol.retention, RetentionPolicy::Keep);
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert!(!config.database.reset_on_start);
        assert_eq!(config.limits.max_payload_length, 44_880);
    }

    #[test]
    fn test_generate_sample() {
        let sample = ShuffleConfig::generate_sample();
        assert!(sample.contains("[protocol]"));
        assert!(sample.contains("[limits]"));
        assert!(sample.contains("[database]"));
        assert!(sample.contains("[devnet]"));
    }

    #[test]
    fn test_parse_sample() {
        let sample = ShuffleConfig::generate_sample();
        let parsed: ShuffleConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.database.backend, StorageBackend::Rocksdb);
        assert_eq!(parsed.protocol.max_participants, DEFAULT_MAX_PARTICIPANTS);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: ShuffleConfig = toml::from_str(
            r#"
            [protocol]
            processing_deadline = 7
            retention = "delete_finished"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.protocol.processing_deadline, 7);
        assert_eq!(parsed.protocol.retention, RetentionPolicy::DeleteFinished);
        assert_eq!(parsed.protocol.deposit, DEFAULT_DEPOSIT);
        assert_eq!(parsed.limits.min_transaction_size, 176);
        assert!(!parsed.database.reset_on_start);
    }

    #[test]
    fn test_database_reset_flag() {
        let parsed: ShuffleConfig = toml::from_str(
            r#"
            [database]
            backend = "rocksdb"
            reset_on_start = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.database.backend, StorageBackend::Rocksdb);
        assert!(parsed.database.reset_on_start);
        assert_eq!(parsed.database.path, DEFAULT_DB_PATH);
    }

    #[test]
    fn test_verification_deadline() {
        let protocol = ProtocolConfig::default();
        assert_eq!(protocol.verification_deadline(3), 103);
    }
}
