//! dmarc-digest - DMARC aggregate report intake
//!
//! Extracts DMARC aggregate reports from email attachments, classifies every record as
//! pass or fail from its DKIM/SPF results, and posts a summary to a chat webhook.
//!
//! `analyze` works on a local file and prints the results as a table, CSV, or JSON.
//! `email-stage` and `report-stage` run the two storage-triggered stages against the
//! local object store.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use prettytable::{row, Cell, Row, Table};
use serde::{Deserialize, Serialize};

use dmarc_digest::archive;
use dmarc_digest::classifier::{classify, verdict};
use dmarc_digest::config::Config;
use dmarc_digest::error::DmarcError;
use dmarc_digest::models::{AuthResult, DmarcReport, ExtractedFile, ReportResult};
use dmarc_digest::notifier::Notifier;
use dmarc_digest::pipeline::{EmailStage, ReportStage};
use dmarc_digest::storage::{parse_storage_notification, LocalObjectStore, ObjectRef};
use dmarc_digest::webhook::WebhookSender;
use dmarc_digest::{parse_dmarc_report, AttachmentExtractor};

/// CLI arguments for dmarc-digest.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "DMARC aggregate report intake and pass/fail notifications",
    long_about = "dmarc-digest extracts DMARC aggregate reports from email attachments (ZIP/GZIP), \
                  classifies every record from its DKIM and SPF results, and posts a summary \
                  to a chat webhook.\n\n\
                  USAGE:\n  dmarc-digest analyze <FILE> [--output <table|csv|json>] [--notify]\n  \
                  dmarc-digest email-stage (--event <JSON> | --bucket <B> --key <K>)\n  \
                  dmarc-digest report-stage (--event <JSON> | --bucket <B> --key <K>)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a local report (.xml, .zip, .gz) or a raw email (.eml)
    Analyze {
        /// Path to the report or email
        #[arg(value_parser)]
        file: PathBuf,

        /// Output format: table, csv, json
        #[arg(short, long, default_value = "table")]
        output: OutputFormat,

        /// Also send the summary to the configured webhook
        #[arg(long)]
        notify: bool,
    },
    /// Extract report attachments from a stored email into the target bucket
    EmailStage(ObjectArgs),
    /// Classify a stored report file and send the notification
    ReportStage(ObjectArgs),
}

/// Which stored objects a stage should process.
#[derive(Args, Debug)]
struct ObjectArgs {
    /// Storage notification JSON (S3 event format)
    #[arg(long, conflicts_with_all = ["bucket", "key"])]
    event: Option<PathBuf>,

    /// Bucket holding the object
    #[arg(long, requires = "key")]
    bucket: Option<String>,

    /// Object key, URL-encoded as in storage notifications
    #[arg(long, requires = "bucket")]
    key: Option<String>,
}

impl ObjectArgs {
    fn objects(&self) -> Result<Vec<ObjectRef>> {
        if let Some(path) = &self.event {
            let json = std::fs::read(path)
                .with_context(|| format!("Failed to read event file {}", path.display()))?;
            return Ok(parse_storage_notification(&json)?);
        }
        match (&self.bucket, &self.key) {
            (Some(bucket), Some(key)) => Ok(vec![ObjectRef::decoded(bucket.as_str(), key)?]),
            _ => Err(anyhow::anyhow!("Either --event or --bucket and --key is required")),
        }
    }
}

/// Supported output formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

/// One analyzed report file.
struct FileAnalysis {
    filename: String,
    report: DmarcReport,
    result: ReportResult,
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    file: &'a str,
    #[serde(flatten)]
    result: &'a ReportResult,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    file: &'a str,
    source_ip: &'a str,
    count: u64,
    header_from: &'a str,
    dkim: String,
    spf: String,
    verdict: String,
}

/// Formats auth results into a clear, human-readable string.
/// If there are no results, returns `empty`.
fn format_auth(results: &[AuthResult], empty: &str) -> String {
    if results.is_empty() {
        return empty.to_string();
    }
    results
        .iter()
        .map(|r| match (&r.domain, &r.selector) {
            (Some(domain), Some(selector)) => {
                format!("{} (selector: {}): {}", domain, selector, r.result)
            }
            (Some(domain), None) => format!("{}:{}", domain, r.result),
            (None, _) => r.result.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Loads the report files held by a local file, choosing the decoder by extension.
fn load_report_files(path: &Path, config: &Config) -> Result<Vec<ExtractedFile>> {
    let mut file = File::open(path).context("Failed to open file")?;
    let file_size = file.metadata()?.len();
    if file_size > config.max_file_size as u64 {
        return Err(DmarcError::FileTooLarge("File too large".to_string()).into());
    }
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;

    let file_name = path
        .file_name()
        .map(|x| x.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = file_name.split('.').last().unwrap_or("").to_lowercase();
    let files = match ext.as_str() {
        "zip" => archive::decode(&content, "application/zip", Some(&file_name), config)?,
        "gz" => archive::decode(&content, "application/gzip", Some(&file_name), config)?,
        "xml" => vec![ExtractedFile::new(file_name, content)],
        "eml" => AttachmentExtractor::new(config.clone()).extract(&content)?,
        _ => {
            return Err(DmarcError::UnsupportedFormat(format!("file extension .{}", ext)).into())
        }
    };
    Ok(files)
}

fn print_table(analyses: &[FileAnalysis]) {
    for analysis in analyses {
        println!("{} {}", "Report file:".bold().blue(), analysis.filename);
        let feedback = &analysis.report.feedback;
        if let Some(metadata) = &feedback.report_metadata {
            if let Some(org) = &metadata.org_name {
                println!("{}: {}", "Reporter".bold(), org);
            }
            if let Some(range) = &metadata.date_range {
                println!(
                    "{}: {} - {}",
                    "Period".bold(),
                    format_timestamp(range.begin),
                    format_timestamp(range.end)
                );
            }
        }
        if let Some(policy) = &feedback.policy_published {
            println!("{}", "DMARC Policy Information".bold().blue());
            println!("{}", "----------------------------".dimmed());
            println!("{}: {}", "Domain".bold(), policy.domain.as_deref().unwrap_or("-"));
            println!("{}: {}", "SPF Alignment".bold(), policy.aspf.clone().unwrap_or_default());
            println!("{}: {}", "DKIM Alignment".bold(), policy.adkim.clone().unwrap_or_default());
            println!("{}: {}", "Policy".bold(), policy.p.clone().unwrap_or_default());
            println!("{}: {}\n", "Percentage Applied".bold(), policy.pct.unwrap_or(100));
        }

        if feedback.records.is_empty() {
            println!("{}\n", "No DMARC records found.".yellow());
            continue;
        }

        let mut table = Table::new();
        table.add_row(row!["Source IP", "Count", "Header From", "DKIM", "SPF", "Verdict"]);
        for record in &feedback.records {
            let verdict_str = verdict(record)
                .map(|v| v.to_string())
                .unwrap_or_else(|e| e.to_string());
            table.add_row(Row::new(vec![
                Cell::new(record.row.source_ip.as_deref().unwrap_or("-")),
                Cell::new(&record.row.count.unwrap_or(0).to_string()),
                Cell::new(record.identifiers.header_from.as_deref().unwrap_or("-")),
                Cell::new(&format_auth(&record.auth_results.dkim, "No DKIM signature")),
                Cell::new(&format_auth(&record.auth_results.spf, "No SPF record")),
                Cell::new(&verdict_str),
            ]));
        }
        table.printstd();

        let result = &analysis.result;
        let summary = format!(
            "{} record(s): {} passed, {} failed",
            result.total_reports, result.total_successes, result.total_failures
        );
        if result.total_failures > 0 {
            println!("{}\n", summary.red().bold());
        } else {
            println!("{}\n", summary.green().bold());
        }
    }
}

fn print_csv(analyses: &[FileAnalysis]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(std::io::stdout());
    for analysis in analyses {
        for record in &analysis.report.feedback.records {
            wtr.serialize(CsvRow {
                file: &analysis.filename,
                source_ip: record.row.source_ip.as_deref().unwrap_or(""),
                count: record.row.count.unwrap_or(0),
                header_from: record.identifiers.header_from.as_deref().unwrap_or(""),
                dkim: format_auth(&record.auth_results.dkim, ""),
                spf: format_auth(&record.auth_results.spf, ""),
                verdict: verdict(record)?.to_string(),
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

async fn analyze(path: &Path, output: OutputFormat, notify: bool, config: &Config) -> Result<()> {
    log::info!("Processing file: {}", path.display());
    let files = load_report_files(path, config).context("Failed to extract file")?;

    let mut analyses = Vec::new();
    for file in files {
        let report = parse_dmarc_report(&file.content)
            .with_context(|| format!("Failed to parse DMARC XML in {}", file.filename))?;
        let result = classify(&report)
            .with_context(|| format!("Failed to classify {}", file.filename))?;
        analyses.push(FileAnalysis {
            filename: file.filename,
            report,
            result,
        });
    }

    match output {
        OutputFormat::Json => {
            let summaries: Vec<JsonSummary> = analyses
                .iter()
                .map(|a| JsonSummary {
                    file: &a.filename,
                    result: &a.result,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        OutputFormat::Csv => print_csv(&analyses)?,
        OutputFormat::Table => {
            if analyses.is_empty() {
                println!("{}", "No report files found.".yellow());
            }
            print_table(&analyses);
        }
    }

    if notify {
        log::info!("Sending results to webhook");
        let notifier = Notifier::new(Arc::new(WebhookSender::from_config(config)?));
        for analysis in &analyses {
            notifier
                .send_result(&analysis.result)
                .await
                .context("Failed to send webhook")?;
        }
    }
    Ok(())
}

async fn run_email_stage(args: &ObjectArgs, config: &Config) -> Result<()> {
    let bucket = config.require_target_bucket()?;
    let objects = args.objects()?;
    let store = Arc::new(LocalObjectStore::new(&config.storage_root));
    let stage = EmailStage::new(store, AttachmentExtractor::new(config.clone()), bucket);

    let mut failures = 0;
    for outcome in stage.handle_all(&objects).await {
        match outcome {
            Ok(report) => {
                for key in &report.uploaded {
                    println!("{} {}/{}", "stored".green(), bucket, key);
                }
                for failure in &report.failed {
                    println!("{} {}/{}: {}", "failed".red(), bucket, failure.key, failure.error);
                }
                failures += report.failed.len();
            }
            Err(_) => failures += 1,
        }
    }
    if failures > 0 {
        return Err(anyhow::anyhow!("{} email or upload operation(s) failed", failures));
    }
    Ok(())
}

async fn run_report_stage(args: &ObjectArgs, config: &Config) -> Result<()> {
    let objects = args.objects()?;
    let store = Arc::new(LocalObjectStore::new(&config.storage_root));
    let notifier = Notifier::new(Arc::new(WebhookSender::from_config(config)?));
    let stage = ReportStage::new(store, notifier);

    let outcomes = stage.handle_all(&objects).await;
    let failures = outcomes.iter().filter(|o| o.is_err()).count();
    for (object, outcome) in objects.iter().zip(&outcomes) {
        match outcome {
            Ok(result) => println!(
                "{} {}: {} passed, {} failed",
                "processed".green(),
                object,
                result.total_successes,
                result.total_failures
            ),
            Err(e) => println!("{} {}: {}", "failed".red(), object, e),
        }
    }
    if failures > 0 {
        return Err(anyhow::anyhow!("{} of {} report(s) failed", failures, objects.len()));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity.
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    println!(
        "{}\n{}\n",
        "dmarc-digest - DMARC aggregate report intake".bold().green(),
        "Extracting, classifying & reporting DMARC data".dimmed()
    );

    let config = Config::new().context("Failed to load configuration")?;

    match cli.command {
        Command::Analyze { file, output, notify } => analyze(&file, output, notify, &config).await?,
        Command::EmailStage(args) => run_email_stage(&args, &config).await?,
        Command::ReportStage(args) => run_report_stage(&args, &config).await?,
    }

    log::info!("{}", "Done!".bold().cyan());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parsing() {
        assert!(matches!(OutputFormat::from_str("table"), Ok(OutputFormat::Table)));
        assert!(matches!(OutputFormat::from_str("csv"), Ok(OutputFormat::Csv)));
        assert!(matches!(OutputFormat::from_str("JSON"), Ok(OutputFormat::Json)));
        assert!(OutputFormat::from_str("invalid").is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_object_args() {
        let cli = Cli::parse_from([
            "dmarc-digest",
            "report-stage",
            "--bucket",
            "attachments",
            "--key",
            "google.com%21example.com.xml",
        ]);
        match cli.command {
            Command::ReportStage(args) => {
                let objects = args.objects().unwrap();
                assert_eq!(objects, vec![ObjectRef::new("attachments", "google.com!example.com.xml")]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_format_auth() {
        let results = vec![
            AuthResult {
                domain: Some("example.com".into()),
                selector: Some("google".into()),
                result: "pass".into(),
                ..AuthResult::default()
            },
            AuthResult {
                domain: Some("example.com".into()),
                result: "fail".into(),
                ..AuthResult::default()
            },
        ];
        assert_eq!(
            format_auth(&results, "none"),
            "example.com (selector: google): pass, example.com:fail"
        );
        assert_eq!(format_auth(&[], "No SPF record"), "No SPF record");
    }
}
