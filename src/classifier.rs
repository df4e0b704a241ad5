//! Authentication Classifier Module
//!
//! Walks the records of a parsed report and decides pass/fail for each one from its
//! DKIM and SPF auth results. A record fails when any of its results is `fail`.
use crate::error::{DmarcError, Result};
use crate::models::{DmarcReport, Record, RecordFailure, ReportResult, Verdict};

/// Decides the verdict for a single record.
///
/// Every DKIM and SPF result is inspected, not just the first.
///
/// # Errors
///
/// Returns `MalformedReport` when the record has no DKIM or no SPF result, since no
/// verdict can be rendered without both mechanisms.
pub fn verdict(record: &Record) -> Result<Verdict> {
    let auth = &record.auth_results;
    if auth.dkim.is_empty() || auth.spf.is_empty() {
        return Err(DmarcError::MalformedReport(format!(
            "record from {} has {} DKIM and {} SPF results; at least one of each is required",
            record.row.source_ip.as_deref().unwrap_or("unknown source"),
            auth.dkim.len(),
            auth.spf.len()
        )));
    }
    let failed = auth
        .dkim
        .iter()
        .chain(auth.spf.iter())
        .any(|r| r.result == "fail");
    Ok(if failed { Verdict::Fail } else { Verdict::Pass })
}

/// Classifies every record of the report and aggregates the totals.
///
/// A failure entry carries the full record as JSON and a one-line summary built from
/// the first DKIM and first SPF result only.
pub fn classify(report: &DmarcReport) -> Result<ReportResult> {
    let mut result = ReportResult::default();
    for record in &report.feedback.records {
        result.total_reports += 1;
        match verdict(record)? {
            Verdict::Pass => result.total_successes += 1,
            Verdict::Fail => {
                result.total_failures += 1;
                let row = serde_json::to_string(record)
                    .map_err(|e| DmarcError::MalformedReport(e.to_string()))?;
                result.failures.push(RecordFailure {
                    row,
                    error: format!(
                        "DKIM: {} SPF: {}",
                        record.auth_results.dkim[0].result, record.auth_results.spf[0].result
                    ),
                });
            }
        }
    }
    log::debug!(
        "Classified {} record(s): {} passed, {} failed",
        result.total_reports,
        result.total_successes,
        result.total_failures
    );
    Ok(result)
}
