//! Archive Decoder Module
//!
//! This module turns attachment bytes into report files. ZIP attachments yield one file
//! per archive member; GZIP attachments yield a single decompressed file. It enforces
//! the security limits from [`Config`]: attachment size, decompressed size, file count,
//! compression ratio, filename length, and path traversal prevention.
use std::io::{Cursor, Read};
use std::path::{Component, Path};
use std::sync::atomic::{AtomicI64, Ordering};

use flate2::read::MultiGzDecoder;
use zip::ZipArchive;

use crate::config::Config;
use crate::error::{DmarcError, Result};
use crate::models::ExtractedFile;

/// How a recognized content type is unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Gzip,
}

impl ArchiveKind {
    /// Maps a declared MIME type to an archive kind.
    ///
    /// Parameters such as `; name="report.zip"` and letter case are ignored.
    pub fn from_content_type(declared_type: &str) -> Option<Self> {
        let mimetype = declared_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match mimetype.as_str() {
            "application/zip" | "application/x-zip" => Some(ArchiveKind::Zip),
            "application/gzip" | "application/x-gzip" => Some(ArchiveKind::Gzip),
            _ => None,
        }
    }
}

/// Decodes an attachment according to its declared content type.
///
/// # Arguments
///
/// * `content` - The raw (transfer-decoded) attachment bytes.
/// * `declared_type` - The attachment's MIME type.
/// * `filename` - The attachment's filename, used to name GZIP output.
/// * `config` - Configuration limits for extraction.
///
/// # Errors
///
/// `UnsupportedFormat` for unrecognized types, `CorruptArchive` for data that does not
/// decode or contains unsafe member names, and `FileTooLarge` when a size limit is hit.
pub fn decode(
    content: &[u8],
    declared_type: &str,
    filename: Option<&str>,
    config: &Config,
) -> Result<Vec<ExtractedFile>> {
    let kind = ArchiveKind::from_content_type(declared_type)
        .ok_or_else(|| DmarcError::UnsupportedFormat(declared_type.to_string()))?;
    if content.len() > config.max_file_size {
        return Err(DmarcError::FileTooLarge(format!(
            "Attachment size {} bytes exceeds limit of {} bytes",
            content.len(),
            config.max_file_size
        )));
    }
    match kind {
        ArchiveKind::Zip => decode_zip(content, config),
        ArchiveKind::Gzip => {
            let decompressed = decode_gzip(content, config)?;
            let name = filename
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(fallback_filename);
            Ok(vec![ExtractedFile::new(name, decompressed)])
        }
    }
}

fn decode_zip(content: &[u8], config: &Config) -> Result<Vec<ExtractedFile>> {
    let mut archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| DmarcError::CorruptArchive(e.to_string()))?;
    if archive.len() > config.max_files_in_zip {
        return Err(DmarcError::CorruptArchive(format!(
            "Too many files in archive: {}",
            archive.len()
        )));
    }
    let mut extracted = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file_in_zip = archive
            .by_index(i)
            .map_err(|e| DmarcError::CorruptArchive(e.to_string()))?;
        if file_in_zip.is_dir() {
            continue;
        }
        let inner_name = file_in_zip.name().to_string();
        // Prevent path traversal
        if is_unsafe_member_name(&inner_name) {
            return Err(DmarcError::CorruptArchive(format!(
                "Path traversal attempt detected: {}",
                inner_name
            )));
        }
        if inner_name.len() > config.max_filename_length {
            return Err(DmarcError::CorruptArchive("Filename too long".to_string()));
        }
        let compressed_size = file_in_zip.compressed_size();
        let uncompressed_size = file_in_zip.size();
        if compressed_size > 0 {
            let compression_ratio = uncompressed_size as f64 / compressed_size as f64;
            if compression_ratio > config.max_compression_ratio {
                return Err(DmarcError::CorruptArchive(format!(
                    "Suspicious compression ratio: {:.2}",
                    compression_ratio
                )));
            }
        }
        if uncompressed_size > config.max_decompressed_size as u64 {
            return Err(DmarcError::FileTooLarge(
                "Total decompressed size too large".to_string(),
            ));
        }
        // The declared size can lie, so the read itself is bounded too.
        let contents = read_bounded(file_in_zip, config.max_decompressed_size)?;
        extracted.push(ExtractedFile::new(inner_name, contents));
    }
    Ok(extracted)
}

/// Rejects absolute names and any `..` segment, with either separator.
fn is_unsafe_member_name(name: &str) -> bool {
    name.starts_with('/')
        || name.starts_with('\\')
        || name.split(['/', '\\']).any(|segment| segment == "..")
        || Path::new(name)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
}

// Concatenated members are one stream, as `gunzip` reads them.
fn decode_gzip(content: &[u8], config: &Config) -> Result<Vec<u8>> {
    read_bounded(MultiGzDecoder::new(content), config.max_decompressed_size)
}

fn read_bounded<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut contents = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut contents)
        .map_err(|e| DmarcError::CorruptArchive(e.to_string()))?;
    if contents.len() > limit {
        return Err(DmarcError::FileTooLarge(
            "Decompressed size too large".to_string(),
        ));
    }
    Ok(contents)
}

static LAST_FALLBACK_STAMP: AtomicI64 = AtomicI64::new(0);

/// Generates `unnamed-<millis>.xml` for attachments that arrive without a filename.
///
/// The stamp is strictly increasing within the process, so two unnamed attachments
/// decoded in the same millisecond still get distinct storage keys.
pub fn fallback_filename() -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let previous = LAST_FALLBACK_STAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now - 1);
    format!("unnamed-{}.xml", now.max(previous + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const REPORT: &[u8] = b"<feedback></feedback>";

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(data).unwrap();
        gz.finish().unwrap()
    }

    fn is_fallback_name(name: &str) -> bool {
        name.strip_prefix("unnamed-")
            .and_then(|rest| rest.strip_suffix(".xml"))
            .map(|stamp| !stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    }

    #[test]
    fn test_zip_yields_one_file_per_member() {
        let archive = zip_bytes(&[
            ("google.com!example.com!1706572800!1706659199.xml", REPORT),
            ("second.xml", &b"<feedback><record/></feedback>"[..]),
            ("nested/third.xml", &b"<feedback/>"[..]),
        ]);
        let files = decode(&archive, "application/zip", Some("report.zip"), &Config::default()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "google.com!example.com!1706572800!1706659199.xml",
                "second.xml",
                "nested/third.xml"
            ]
        );
        assert_eq!(files[0].content, REPORT);
    }

    #[test]
    fn test_zip_skips_directory_entries() {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.add_directory("reports/", SimpleFileOptions::default()).unwrap();
        zip.start_file("reports/a.xml", SimpleFileOptions::default()).unwrap();
        zip.write_all(REPORT).unwrap();
        let archive = zip.finish().unwrap().into_inner();

        let files = decode(&archive, "application/x-zip", None, &Config::default()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "reports/a.xml");
    }

    #[test]
    fn test_gzip_uses_attachment_filename() {
        let files = decode(
            &gzip_bytes(REPORT),
            "application/gzip",
            Some("example.com!1706572800.xml.gz"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "example.com!1706572800.xml.gz");
        assert_eq!(files[0].content, REPORT);
    }

    #[test]
    fn test_gzip_reads_every_member() {
        let mut stream = gzip_bytes(b"<feedback>");
        stream.extend(gzip_bytes(b"</feedback>"));
        let files = decode(&stream, "application/gzip", Some("split.xml.gz"), &Config::default()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, REPORT);
    }

    #[test]
    fn test_member_names_with_dots_are_not_traversal() {
        let archive = zip_bytes(&[("report..xml", REPORT), ("v1..2/report.xml", REPORT)]);
        let files = decode(&archive, "application/zip", None, &Config::default()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename, "report..xml");

        for name in ["../evil.xml", "a/../../evil.xml", "..\\evil.xml", "a\\..\\evil.xml"] {
            let archive = zip_bytes(&[(name, REPORT)]);
            let result = decode(&archive, "application/zip", None, &Config::default());
            assert!(matches!(result, Err(DmarcError::CorruptArchive(_))), "{:?}", name);
        }
    }

    #[test]
    fn test_gzip_without_filename_gets_fallback_name() {
        let config = Config::default();
        let first = decode(&gzip_bytes(REPORT), "application/x-gzip", None, &config).unwrap();
        let second = decode(&gzip_bytes(REPORT), "application/x-gzip", Some("  "), &config).unwrap();
        assert_eq!(first.len(), 1);
        assert!(is_fallback_name(&first[0].filename), "{}", first[0].filename);
        assert!(is_fallback_name(&second[0].filename), "{}", second[0].filename);
        assert_ne!(first[0].filename, second[0].filename);
    }

    #[test]
    fn test_content_type_parameters_and_case_are_ignored() {
        assert_eq!(
            ArchiveKind::from_content_type("Application/ZIP; name=\"report.zip\""),
            Some(ArchiveKind::Zip)
        );
        assert_eq!(ArchiveKind::from_content_type(" application/gzip "), Some(ArchiveKind::Gzip));
        assert_eq!(ArchiveKind::from_content_type("text/xml"), None);
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let result = decode(REPORT, "application/x-unknown", None, &Config::default());
        assert!(matches!(result, Err(DmarcError::UnsupportedFormat(t)) if t == "application/x-unknown"));
    }

    #[test]
    fn test_corrupt_data_is_reported() {
        let config = Config::default();
        let zip = decode(b"definitely not a zip file", "application/zip", None, &config);
        assert!(matches!(zip, Err(DmarcError::CorruptArchive(_))));
        let gz = decode(b"definitely not a gzip stream", "application/gzip", None, &config);
        assert!(matches!(gz, Err(DmarcError::CorruptArchive(_))));
    }

    #[test]
    fn test_size_limits() {
        let config = Config {
            max_file_size: 16,
            ..Config::default()
        };
        let result = decode(&[0u8; 17], "application/gzip", None, &config);
        assert!(matches!(result, Err(DmarcError::FileTooLarge(_))));

        let config = Config {
            max_decompressed_size: 8,
            ..Config::default()
        };
        let result = decode(&gzip_bytes(REPORT), "application/gzip", None, &config);
        assert!(matches!(result, Err(DmarcError::FileTooLarge(_))));
    }

    #[test]
    fn test_too_many_members() {
        let archive = zip_bytes(&[("a.xml", REPORT), ("b.xml", REPORT), ("c.xml", REPORT)]);
        let config = Config {
            max_files_in_zip: 2,
            ..Config::default()
        };
        let result = decode(&archive, "application/zip", None, &config);
        assert!(matches!(result, Err(DmarcError::CorruptArchive(msg)) if msg.contains("Too many files")));
    }
}
