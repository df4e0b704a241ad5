//! Error Handling Module
//!
//! This module defines the error taxonomy for dmarc-digest using the `thiserror` crate.
//! Attachment-level errors (`UnsupportedFormat`, `CorruptArchive`, `FileTooLarge`) are
//! contained by the extractor; `MalformedReport` aborts a single report; and
//! `NotificationDelivery` is returned to whoever asked for the notification.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DmarcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported attachment type: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("File too large: {0}")]
    FileTooLarge(String),

    #[error("Malformed DMARC report: {0}")]
    MalformedReport(String),

    #[error("Notification delivery failed: {0}")]
    NotificationDelivery(String),

    #[error("Email parse error: {0}")]
    Mail(#[from] mailparse::MailParseError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid object key: {0}")]
    InvalidObjectKey(String),
}

impl DmarcError {
    /// Returns true for errors that only disqualify a single attachment.
    pub fn is_attachment_local(&self) -> bool {
        matches!(
            self,
            DmarcError::UnsupportedFormat(_)
                | DmarcError::CorruptArchive(_)
                | DmarcError::FileTooLarge(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DmarcError>;
