//! dmarc-digest Library
//!
//! This library provides the core functionality for dmarc-digest: configuration, error
//! handling, data models, archive decoding, email attachment extraction, DMARC XML
//! parsing, pass/fail classification, notifications, object storage and the two
//! processing stages built from them.

pub mod archive;
pub mod attachments;
pub mod classifier;
pub mod config;
pub mod error;
pub mod models;
pub mod notifier;
pub mod pipeline;
pub mod storage;
pub mod webhook;
pub mod xml_parser;

pub use attachments::AttachmentExtractor;
pub use classifier::classify;
pub use config::Config;
pub use error::DmarcError;
pub use xml_parser::parse_dmarc_report;
