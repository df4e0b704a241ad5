//! Data Models Module
//!
//! This module defines the core data structures used by dmarc-digest: files pulled
//! out of email attachments, the typed DMARC aggregate report tree, and the
//! pass/fail summary produced by the classifier.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single file produced from an attachment, ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub filename: String,
    pub content: Vec<u8>,
}

impl ExtractedFile {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content,
        }
    }
}

/// A parsed DMARC aggregate report document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DmarcReport {
    pub feedback: Feedback,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Feedback {
    pub version: Option<String>,
    pub report_metadata: Option<ReportMetadata>,
    pub policy_published: Option<PolicyPublished>,
    pub records: Vec<Record>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ReportMetadata {
    pub org_name: Option<String>,
    pub email: Option<String>,
    pub report_id: Option<String>,
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DateRange {
    pub begin: i64,
    pub end: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PolicyPublished {
    pub domain: Option<String>,
    pub adkim: Option<AlignmentMode>,
    pub aspf: Option<AlignmentMode>,
    pub p: Option<PolicyType>,
    pub sp: Option<PolicyType>,
    pub pct: Option<u8>,
    pub fo: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Record {
    pub row: Row,
    pub identifiers: Identifiers,
    pub auth_results: AuthResults,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Row {
    pub source_ip: Option<String>,
    pub count: Option<u64>,
    pub policy_evaluated: PolicyEvaluated,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PolicyEvaluated {
    pub disposition: Option<String>,
    pub dkim: Option<String>,
    pub spf: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Identifiers {
    pub envelope_from: Option<String>,
    pub header_from: Option<String>,
}

/// Every `<dkim>` and `<spf>` entry of a record, in document order.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AuthResults {
    pub dkim: Vec<AuthResult>,
    pub spf: Vec<AuthResult>,
}

/// One DKIM or SPF evaluation. `result` is kept verbatim (`pass`, `fail`,
/// `softfail`, `temperror`, ...) so nothing is lost before classification.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AuthResult {
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub result: String,
}

/// Aggregate classification of one report document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReportResult {
    pub total_reports: usize,
    pub total_successes: usize,
    pub total_failures: usize,
    pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RecordFailure {
    /// The full record serialized as JSON.
    pub row: String,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub enum PolicyType {
    #[default]
    None,
    Quarantine,
    Reject,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}
impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentMode::Relaxed => write!(f, "relaxed"),
            AlignmentMode::Strict => write!(f, "strict"),
        }
    }
}
impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::None => write!(f, "none"),
            PolicyType::Quarantine => write!(f, "quarantine"),
            PolicyType::Reject => write!(f, "reject"),
        }
    }
}
impl FromStr for AlignmentMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "r" | "relaxed" => Ok(AlignmentMode::Relaxed),
            "s" | "strict" => Ok(AlignmentMode::Strict),
            _ => Err(format!("Invalid alignment mode: {}", s)),
        }
    }
}
impl FromStr for PolicyType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(PolicyType::None),
            "quarantine" => Ok(PolicyType::Quarantine),
            "reject" => Ok(PolicyType::Reject),
            _ => Err(format!("Invalid policy type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing_is_case_insensitive() {
        assert_eq!("Reject".parse::<PolicyType>(), Ok(PolicyType::Reject));
        assert_eq!("s".parse::<AlignmentMode>(), Ok(AlignmentMode::Strict));
        assert!("sometimes".parse::<PolicyType>().is_err());
    }

    #[test]
    fn test_report_result_uses_camel_case_fields() {
        let result = ReportResult {
            total_reports: 2,
            total_successes: 1,
            total_failures: 1,
            failures: vec![RecordFailure {
                row: "{}".to_string(),
                error: "DKIM: fail SPF: pass".to_string(),
            }],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["totalReports"], 2);
        assert_eq!(json["totalSuccesses"], 1);
        assert_eq!(json["totalFailures"], 1);
        assert_eq!(json["failures"][0]["error"], "DKIM: fail SPF: pass");
    }
}
