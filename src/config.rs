//! Configuration Module
//!
//! This module reads configuration values from environment variables, provides
//! sensible defaults, and validates key security parameters such as maximum file
//! sizes and decompression limits. The destination bucket and webhook endpoint
//! also come from here; the bucket is only required by the email stage.

use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub webhook_url: Option<String>,
    pub webhook_timeout: u64,
    pub target_bucket: Option<String>,
    pub storage_root: PathBuf,
    pub max_file_size: usize,
    pub max_decompressed_size: usize,
    pub max_files_in_zip: usize,
    pub max_compression_ratio: f64,
    pub max_filename_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            webhook_url: None,
            webhook_timeout: 30,
            target_bucket: None,
            storage_root: PathBuf::from("storage"),
            max_file_size: 10 * 1024 * 1024,
            max_decompressed_size: 100 * 1024 * 1024,
            max_files_in_zip: 1000,
            max_compression_ratio: 1000.0,
            max_filename_length: 256,
        }
    }
}

impl Config {
    /// Creates a new configuration by reading environment variables.
    /// If a variable is missing or empty, a default value is used.
    pub fn new() -> Result<Self> {
        let defaults = Config::default();

        let max_file_size = env::var("DMARC_MAX_FILE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_file_size);

        if max_file_size > 500_000_000 {
            return Err(anyhow::anyhow!("Max file size too large (500MB limit)"));
        }

        // For webhook_timeout, try DMARC_WEBHOOK_TIMEOUT_SECS then DMARC_WEBHOOK_TIMEOUT.
        let webhook_timeout = env::var("DMARC_WEBHOOK_TIMEOUT_SECS")
            .or_else(|_| env::var("DMARC_WEBHOOK_TIMEOUT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.webhook_timeout);

        let max_decompressed_size = env::var("DMARC_MAX_DECOMPRESSED_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_decompressed_size);

        let max_files_in_zip = env::var("DMARC_MAX_FILES_IN_ZIP")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_files_in_zip);

        let max_compression_ratio = env::var("DMARC_MAX_COMPRESSION_RATIO")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_compression_ratio);

        let max_filename_length = env::var("DMARC_MAX_FILENAME_LENGTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_filename_length);

        // Slack-era deployments export SLACK_WEBHOOK_URL / S3_TARGET_BUCKET_NAME.
        let webhook_url = non_empty_var("DMARC_WEBHOOK_URL")
            .or_else(|| non_empty_var("SLACK_WEBHOOK_URL"));

        let target_bucket = non_empty_var("DMARC_TARGET_BUCKET")
            .or_else(|| non_empty_var("S3_TARGET_BUCKET_NAME"));

        let storage_root = non_empty_var("DMARC_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root);

        Ok(Config {
            webhook_url,
            webhook_timeout,
            target_bucket,
            storage_root,
            max_file_size,
            max_decompressed_size,
            max_files_in_zip,
            max_compression_ratio,
            max_filename_length,
        })
    }

    /// Returns the destination bucket for extracted files, failing when unset.
    pub fn require_target_bucket(&self) -> Result<&str> {
        self.target_bucket
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DMARC_TARGET_BUCKET is not set"))
    }
}

/// Reads an environment variable, trimming it and treating blank values as unset.
fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
}
