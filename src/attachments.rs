//! Email Attachment Extractor Module
//!
//! This module parses a raw email, collects its attachment parts, and routes each one
//! through the archive decoder. A bad attachment is logged and skipped; it never costs
//! the other attachments of the same message.
use mailparse::{DispositionType, ParsedMail};
use rayon::prelude::*;

use crate::archive;
use crate::config::Config;
use crate::error::{DmarcError, Result};
use crate::models::ExtractedFile;

/// A leaf MIME part that carries a file.
#[derive(Debug, Clone)]
pub struct AttachmentPart {
    pub content_type: String,
    pub filename: Option<String>,
    pub content: Vec<u8>,
}

/// AttachmentExtractor turns raw email messages into extracted report files.
#[derive(Debug, Clone)]
pub struct AttachmentExtractor {
    config: Config,
}

impl AttachmentExtractor {
    /// Creates a new AttachmentExtractor with the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Extracts every decodable report file from a raw email message.
    ///
    /// Fails only when the message itself cannot be parsed. Attachments with an
    /// unsupported type or undecodable content are skipped.
    pub fn extract(&self, raw_message: &[u8]) -> Result<Vec<ExtractedFile>> {
        let parts = collect_attachments(raw_message)?;
        log::debug!("Found {} attachment(s)", parts.len());

        let decoded: Vec<(AttachmentPart, Result<Vec<ExtractedFile>>)> = parts
            .into_par_iter()
            .map(|part| {
                let result = archive::decode(
                    &part.content,
                    &part.content_type,
                    part.filename.as_deref(),
                    &self.config,
                );
                (part, result)
            })
            .collect();

        let mut files = Vec::new();
        for (part, result) in decoded {
            let label = part.filename.as_deref().unwrap_or("<unnamed>");
            match result {
                Ok(extracted) => {
                    log::info!(
                        "Attachment {} ({}) produced {} file(s)",
                        label,
                        part.content_type,
                        extracted.len()
                    );
                    files.extend(extracted);
                }
                Err(e) if e.is_attachment_local() => {
                    log::warn!("Skipping attachment {} ({}): {}", label, part.content_type, e);
                }
                Err(e) => {
                    log::error!("Failed to decode attachment {} ({}): {}", label, part.content_type, e);
                }
            }
        }
        Ok(files)
    }
}

/// Parses a raw message and returns its attachment parts in MIME order.
pub fn collect_attachments(raw_message: &[u8]) -> Result<Vec<AttachmentPart>> {
    let mail = mailparse::parse_mail(raw_message)?;
    let mut parts = Vec::new();
    walk(&mail, &mut parts);
    Ok(parts)
}

fn walk(part: &ParsedMail<'_>, out: &mut Vec<AttachmentPart>) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk(sub, out);
        }
        return;
    }
    if !is_attachment(part) {
        return;
    }
    let filename = attachment_filename(part);
    // A part whose transfer encoding is broken is one bad attachment, not a bad message.
    let content = match part.get_body_raw() {
        Ok(content) => content,
        Err(e) => {
            log::warn!(
                "Skipping attachment {}: {}",
                filename.as_deref().unwrap_or("<unnamed>"),
                DmarcError::Mail(e)
            );
            return;
        }
    };
    out.push(AttachmentPart {
        content_type: part.ctype.mimetype.to_ascii_lowercase(),
        filename,
        content,
    });
}

fn is_attachment(part: &ParsedMail<'_>) -> bool {
    if part.get_content_disposition().disposition == DispositionType::Attachment {
        return true;
    }
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    !(mimetype.starts_with("text/")
        || mimetype.starts_with("multipart/")
        || mimetype.starts_with("message/"))
}

fn attachment_filename(part: &ParsedMail<'_>) -> Option<String> {
    part.get_content_disposition()
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
