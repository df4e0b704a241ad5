//! Notification Module
//!
//! Formats the human-readable summary of a processed report and hands it to a
//! [`MessageSender`]. The classifier and the pipeline only ever talk to this module,
//! so the transport can be swapped or mocked without touching them.
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DmarcError, Result};
use crate::models::ReportResult;

/// Delivers one text message to a chat channel.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, text: &str) -> Result<()>;
}

pub const UNKNOWN_ERROR_MESSAGE: &str =
    "Error processing DMARC report and unknown error type! Check logs for details.";

pub fn success_message(result: &ReportResult) -> String {
    format!(
        "Incoming DMARC report processed successfully. {} passed!",
        result.total_successes
    )
}

pub fn failure_message(result: &ReportResult) -> String {
    let rows: Vec<&str> = result.failures.iter().map(|f| f.row.as_str()).collect();
    format!(
        "Incoming DMARC report contained failures! {} passed, {} failed! Failures: {}",
        result.total_successes,
        result.total_failures,
        serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string())
    )
}

/// Builds the error text. Only errors from this crate are spelled out; anything else
/// is reported generically and its detail stays in the logs.
pub fn error_message(error: &anyhow::Error) -> String {
    if error.downcast_ref::<DmarcError>().is_some() {
        format!("Error processing DMARC report: {:#}", error)
    } else {
        UNKNOWN_ERROR_MESSAGE.to_string()
    }
}

/// Notifier sends success, failure and error summaries through a sender.
#[derive(Clone)]
pub struct Notifier {
    sender: Arc<dyn MessageSender>,
}

impl Notifier {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    pub async fn send_success(&self, result: &ReportResult) -> Result<()> {
        let message = success_message(result);
        log::info!("{}", message);
        self.sender.send_message(&message).await
    }

    pub async fn send_failure(&self, result: &ReportResult) -> Result<()> {
        let message = failure_message(result);
        log::info!("{}", message);
        self.sender.send_message(&message).await
    }

    /// Picks the success or failure summary depending on the result.
    pub async fn send_result(&self, result: &ReportResult) -> Result<()> {
        if result.total_failures > 0 {
            self.send_failure(result).await
        } else {
            self.send_success(result).await
        }
    }

    pub async fn send_error(&self, error: &anyhow::Error) -> Result<()> {
        let message = error_message(error);
        log::error!("{}", message);
        if error.downcast_ref::<DmarcError>().is_none() {
            log::error!("{:?}", error);
        }
        self.sender.send_message(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordFailure;
    use anyhow::Context;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        messages: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_message(&self, text: &str) -> Result<()> {
            if self.fail {
                return Err(DmarcError::NotificationDelivery("Bad Gateway".to_string()));
            }
            self.messages.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn failing_result() -> ReportResult {
        ReportResult {
            total_reports: 3,
            total_successes: 1,
            total_failures: 2,
            failures: vec![
                RecordFailure {
                    row: r#"{"row":{"source_ip":"192.0.2.1"}}"#.to_string(),
                    error: "DKIM: fail SPF: pass".to_string(),
                },
                RecordFailure {
                    row: r#"{"row":{"source_ip":"192.0.2.2"}}"#.to_string(),
                    error: "DKIM: pass SPF: fail".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_success_message() {
        let result = ReportResult {
            total_reports: 4,
            total_successes: 4,
            ..ReportResult::default()
        };
        assert_eq!(
            success_message(&result),
            "Incoming DMARC report processed successfully. 4 passed!"
        );
    }

    #[test]
    fn test_failure_message_lists_every_row() {
        let message = failure_message(&failing_result());
        assert!(message.starts_with("Incoming DMARC report contained failures! 1 passed, 2 failed! Failures: ["));
        let json = message.split("Failures: ").nth(1).unwrap();
        let rows: Vec<String> = serde_json::from_str(json).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].contains("192.0.2.2"));
    }

    #[test]
    fn test_error_message_distinguishes_known_errors() {
        let known = anyhow::Error::new(DmarcError::MalformedReport("record 1 has no <auth_results>".into()));
        assert_eq!(
            error_message(&known),
            "Error processing DMARC report: Malformed DMARC report: record 1 has no <auth_results>"
        );

        let with_context = Err::<(), _>(DmarcError::Storage("connection reset".into()))
            .context("Failed to fetch attachments/report.xml")
            .unwrap_err();
        assert_eq!(
            error_message(&with_context),
            "Error processing DMARC report: Failed to fetch attachments/report.xml: Storage error: connection reset"
        );

        let unknown = anyhow::anyhow!("something odd happened");
        assert_eq!(error_message(&unknown), UNKNOWN_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_notifier_sends_through_sender() {
        let sender = Arc::new(RecordingSender::default());
        let notifier = Notifier::new(sender.clone());
        notifier.send_result(&failing_result()).await.unwrap();
        notifier
            .send_result(&ReportResult { total_reports: 1, total_successes: 1, ..ReportResult::default() })
            .await
            .unwrap();
        notifier.send_error(&anyhow::anyhow!("opaque")).await.unwrap();

        let messages = sender.messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains("contained failures"));
        assert!(messages[1].contains("1 passed!"));
        assert_eq!(messages[2], UNKNOWN_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_returned() {
        let sender = Arc::new(RecordingSender { fail: true, ..RecordingSender::default() });
        let notifier = Notifier::new(sender);
        let result = notifier.send_success(&ReportResult::default()).await;
        assert!(matches!(result, Err(DmarcError::NotificationDelivery(_))));
    }
}
