//! Pipeline Module
//!
//! The two processing stages. [`EmailStage`] turns a stored raw email into extracted
//! report files in the destination bucket; [`ReportStage`] turns one stored report file
//! into a notification. Each call handles one object and keeps no state between calls.
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;

use crate::attachments::AttachmentExtractor;
use crate::classifier::classify;
use crate::error::DmarcError;
use crate::models::{ExtractedFile, ReportResult};
use crate::notifier::Notifier;
use crate::storage::{ObjectRef, ObjectStore};
use crate::xml_parser::parse_dmarc_report;

/// Outcome of uploading the files extracted from one email.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    pub failed: Vec<UploadFailure>,
}

#[derive(Debug)]
pub struct UploadFailure {
    pub key: String,
    pub error: DmarcError,
}

/// Fetches raw emails, extracts their report attachments and stores them.
pub struct EmailStage {
    store: Arc<dyn ObjectStore>,
    extractor: AttachmentExtractor,
    target_bucket: String,
}

impl EmailStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        extractor: AttachmentExtractor,
        target_bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            extractor,
            target_bucket: target_bucket.into(),
        }
    }

    /// Processes one stored email.
    ///
    /// Fails when the email cannot be fetched or parsed. Upload failures are collected
    /// in the returned report and never stop the other uploads.
    pub async fn handle(&self, object: &ObjectRef) -> Result<UploadReport> {
        log::info!("Processing email {}", object);
        let raw = self
            .store
            .get(&object.bucket, &object.key)
            .await
            .with_context(|| format!("Failed to fetch email {}", object))?;
        // Decoding is CPU-bound and fans out over rayon; keep it off the async workers.
        let extractor = self.extractor.clone();
        let files = tokio::task::spawn_blocking(move || extractor.extract(&raw))
            .await
            .with_context(|| format!("Extraction task for {} failed", object))?
            .with_context(|| format!("Failed to parse email {}", object))?;
        if files.is_empty() {
            log::warn!("Email {} contained no report attachments", object);
        }
        Ok(self.upload_all(&files).await)
    }

    /// Processes every object of a notification, logging per-object failures.
    pub async fn handle_all(&self, objects: &[ObjectRef]) -> Vec<Result<UploadReport>> {
        let mut outcomes = Vec::with_capacity(objects.len());
        for object in objects {
            let outcome = self.handle(object).await;
            if let Err(e) = &outcome {
                log::error!("Error processing email {}: {:#}", object, e);
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn upload_all(&self, files: &[ExtractedFile]) -> UploadReport {
        let uploads = files.iter().map(|file| async move {
            let result = self
                .store
                .put(&self.target_bucket, &file.filename, &file.content)
                .await;
            (file.filename.clone(), result)
        });

        let mut report = UploadReport::default();
        for (key, result) in join_all(uploads).await {
            match result {
                Ok(()) => {
                    log::info!("Uploaded {}/{}", self.target_bucket, key);
                    report.uploaded.push(key);
                }
                Err(error) => {
                    log::error!("Error uploading {}/{}: {}", self.target_bucket, key, error);
                    report.failed.push(UploadFailure { key, error });
                }
            }
        }
        report
    }
}

/// Fetches stored report files, classifies them and sends one notification each.
pub struct ReportStage {
    store: Arc<dyn ObjectStore>,
    notifier: Notifier,
}

impl ReportStage {
    pub fn new(store: Arc<dyn ObjectStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Fetches, parses and classifies one report file.
    pub async fn analyze(&self, object: &ObjectRef) -> Result<ReportResult> {
        let document = self
            .store
            .get(&object.bucket, &object.key)
            .await
            .with_context(|| format!("Failed to fetch report {}", object))?;
        let report = parse_dmarc_report(&document)
            .with_context(|| format!("Failed to parse report {}", object))?;
        let result = classify(&report)
            .with_context(|| format!("Failed to classify report {}", object))?;
        Ok(result)
    }

    /// Processes one report file and notifies about the outcome.
    ///
    /// Processing errors become an error notification and are then returned. A failed
    /// notification is returned as `NotificationDelivery`.
    pub async fn handle(&self, object: &ObjectRef) -> Result<ReportResult, DmarcError> {
        log::info!("Processing report {}", object);
        match self.analyze(object).await {
            Ok(result) => {
                self.notifier.send_result(&result).await?;
                Ok(result)
            }
            Err(e) => {
                log::error!("Error processing report {}: {:#}", object, e);
                self.notifier.send_error(&e).await?;
                Err(report_error(e))
            }
        }
    }

    /// Processes every object of a notification; one bad report never stops the rest.
    pub async fn handle_all(&self, objects: &[ObjectRef]) -> Vec<Result<ReportResult, DmarcError>> {
        let mut outcomes = Vec::with_capacity(objects.len());
        for object in objects {
            outcomes.push(self.handle(object).await);
        }
        outcomes
    }
}

/// Recovers the typed error behind a processing failure that was already notified.
fn report_error(error: anyhow::Error) -> DmarcError {
    match error.downcast::<DmarcError>() {
        Ok(e) => e,
        Err(other) => DmarcError::MalformedReport(format!("{:#}", other)),
    }
}
