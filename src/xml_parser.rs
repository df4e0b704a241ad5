//! XML Parser Module
//!
//! This module parses DMARC aggregate XML reports into the typed [`DmarcReport`] tree.
//! Shape is validated once, here: a record without `<auth_results>` or an auth entry
//! without `<result>` is rejected as a malformed report instead of surfacing later as
//! a missing field. An empty document, or a `<feedback>` without records, is a valid
//! empty report.
//!
//! The parser enforces a nesting depth limit and completely disables the processing of
//! DOCTYPE declarations (and hence external/internal entities) by removing any DOCTYPE
//! block from the input. If a DOCTYPE block contains two or more entity definitions,
//! the XML is rejected.

use std::borrow::Cow;
use std::str::FromStr;

use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::reader::Reader;

use crate::error::{DmarcError, Result};
use crate::models::{
    AuthResult, AuthResults, DateRange, DmarcReport, Feedback, Identifiers, PolicyEvaluated,
    PolicyPublished, Record, ReportMetadata, Row,
};

const MAX_DEPTH: u32 = 20;

/// Parses a DMARC aggregate report document.
///
/// # Errors
///
/// Returns `MalformedReport` if the document is not UTF-8, is not well-formed XML,
/// has a root other than `<feedback>`, or does not match the record shape.
pub fn parse_dmarc_report(document: &[u8]) -> Result<DmarcReport> {
    let text = std::str::from_utf8(document)
        .map_err(|e| malformed(format!("report is not valid UTF-8: {}", e)))?;
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Ok(DmarcReport::default());
    }
    let cleaned = strip_doctype(text)?;
    let mut reader = ReportReader::new(&cleaned);
    let feedback = reader.parse_root()?;
    Ok(DmarcReport { feedback })
}

/// Removes a DOCTYPE block, rejecting ones that define two or more entities.
fn strip_doctype(xml_content: &str) -> Result<Cow<'_, str>> {
    let Some(start) = xml_content.find("<!DOCTYPE") else {
        return Ok(Cow::Borrowed(xml_content));
    };
    let declaration = &xml_content[start..];
    let Some(close) = declaration.find('>') else {
        return Err(malformed("unterminated DOCTYPE"));
    };
    let end = match declaration[..close].find('[') {
        // The internal subset ends at the first `]` followed by `>`.
        Some(open) => declaration[open..]
            .match_indices(']')
            .map(|(i, _)| open + i)
            .find_map(|i| {
                let rest = &declaration[i + 1..];
                let gap = rest.len() - rest.trim_start().len();
                rest.trim_start().starts_with('>').then_some(i + 1 + gap + 1)
            })
            .ok_or_else(|| malformed("unterminated DOCTYPE internal subset"))?,
        None => close + 1,
    };
    let doctype = &declaration[..end];
    if doctype.matches("<!ENTITY").count() >= 2 {
        return Err(malformed("Recursive entities detected"));
    }
    let before = &xml_content[..start];
    let after = &declaration[end..];
    Ok(Cow::Owned(format!("{}{}", before, after)))
}

fn malformed(message: impl Into<String>) -> DmarcError {
    DmarcError::MalformedReport(message.into())
}

fn xml_error(e: quick_xml::Error) -> DmarcError {
    malformed(format!("XML error: {}", e))
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

/// An element just read from the stream. `open` is false for `<empty/>` elements,
/// which have neither text nor children to consume.
struct Child {
    name: String,
    open: bool,
}

struct ReportReader<'a> {
    reader: Reader<&'a [u8]>,
    depth: u32,
}

impl<'a> ReportReader<'a> {
    fn new(xml: &'a str) -> Self {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        Self { reader, depth: 0 }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(malformed("XML recursion depth limit exceeded"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn parse_root(&mut self) -> Result<Feedback> {
        loop {
            let child = match self.reader.read_event().map_err(xml_error)? {
                Event::Start(e) => {
                    self.enter()?;
                    Child { name: element_name(&e), open: true }
                }
                Event::Empty(e) => Child { name: element_name(&e), open: false },
                Event::Text(t) => {
                    if t.iter().any(|b| !b.is_ascii_whitespace()) {
                        return Err(malformed("unexpected text outside the <feedback> element"));
                    }
                    continue;
                }
                // Nothing but a prolog or comments.
                Event::Eof => return Ok(Feedback::default()),
                _ => continue,
            };
            if child.name != "feedback" {
                return Err(malformed(format!(
                    "expected <feedback> root element, found <{}>",
                    child.name
                )));
            }
            let feedback = self.parse_feedback(&child)?;
            self.expect_end_of_document()?;
            return Ok(feedback);
        }
    }

    /// Only whitespace, comments and processing instructions may follow the root.
    fn expect_end_of_document(&mut self) -> Result<()> {
        loop {
            match self.reader.read_event().map_err(xml_error)? {
                Event::Eof => return Ok(()),
                Event::Start(_) | Event::Empty(_) | Event::End(_) | Event::CData(_) => {
                    return Err(malformed("content after the <feedback> element"));
                }
                Event::Text(t) => {
                    if t.iter().any(|b| !b.is_ascii_whitespace()) {
                        return Err(malformed("content after the <feedback> element"));
                    }
                }
                _ => {}
            }
        }
    }

    /// Reads up to the next child element of `parent`, or returns `None` at its end tag.
    fn next_child(&mut self, parent: &Child) -> Result<Option<Child>> {
        if !parent.open {
            return Ok(None);
        }
        loop {
            match self.reader.read_event().map_err(xml_error)? {
                Event::Start(e) => {
                    self.enter()?;
                    return Ok(Some(Child { name: element_name(&e), open: true }));
                }
                Event::Empty(e) => {
                    return Ok(Some(Child { name: element_name(&e), open: false }));
                }
                Event::End(_) => {
                    self.leave();
                    return Ok(None);
                }
                Event::Eof => {
                    return Err(malformed(format!(
                        "unexpected end of document inside <{}>",
                        parent.name
                    )));
                }
                _ => {}
            }
        }
    }

    fn skip(&mut self, child: &Child) -> Result<()> {
        if child.open {
            self.reader
                .read_to_end(QName(child.name.as_bytes()))
                .map_err(xml_error)?;
            self.leave();
        }
        Ok(())
    }

    /// Reads the character data of a leaf element. Text and CDATA sections are joined;
    /// a nested element makes the document malformed.
    fn text(&mut self, child: &Child) -> Result<Option<String>> {
        if !child.open {
            return Ok(None);
        }
        let mut value = String::new();
        loop {
            match self.reader.read_event().map_err(xml_error)? {
                Event::Text(t) => {
                    let raw = std::str::from_utf8(&t)
                        .map_err(|e| malformed(format!("invalid text in <{}>: {}", child.name, e)))?;
                    let unescaped = unescape(raw)
                        .map_err(|e| malformed(format!("invalid text in <{}>: {}", child.name, e)))?;
                    value.push_str(&unescaped);
                }
                Event::CData(c) => {
                    let raw = c.into_inner();
                    let data = std::str::from_utf8(&raw)
                        .map_err(|e| malformed(format!("invalid CDATA in <{}>: {}", child.name, e)))?;
                    value.push_str(data);
                }
                Event::End(_) => {
                    self.leave();
                    break;
                }
                Event::Start(e) | Event::Empty(e) => {
                    return Err(malformed(format!(
                        "unexpected element <{}> inside <{}>",
                        element_name(&e),
                        child.name
                    )));
                }
                Event::Eof => {
                    return Err(malformed(format!(
                        "unexpected end of document inside <{}>",
                        child.name
                    )));
                }
                _ => {}
            }
        }
        let value = value.trim();
        Ok(Some(value.to_string()).filter(|v| !v.is_empty()))
    }

    fn number<T: FromStr>(&mut self, child: &Child) -> Result<Option<T>> {
        match self.text(child)? {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| {
                malformed(format!("invalid <{}> value: {}", child.name, value))
            }),
        }
    }

    fn parse_feedback(&mut self, element: &Child) -> Result<Feedback> {
        let mut feedback = Feedback::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "version" => feedback.version = self.text(&child)?,
                "report_metadata" => {
                    feedback.report_metadata = Some(self.parse_report_metadata(&child)?)
                }
                "policy_published" => {
                    feedback.policy_published = Some(self.parse_policy_published(&child)?)
                }
                "record" => {
                    let index = feedback.records.len();
                    feedback.records.push(self.parse_record(&child, index)?);
                }
                _ => self.skip(&child)?,
            }
        }
        Ok(feedback)
    }

    fn parse_report_metadata(&mut self, element: &Child) -> Result<ReportMetadata> {
        let mut metadata = ReportMetadata::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "org_name" => metadata.org_name = self.text(&child)?,
                "email" => metadata.email = self.text(&child)?,
                "report_id" => metadata.report_id = self.text(&child)?,
                "date_range" => metadata.date_range = Some(self.parse_date_range(&child)?),
                _ => self.skip(&child)?,
            }
        }
        Ok(metadata)
    }

    fn parse_date_range(&mut self, element: &Child) -> Result<DateRange> {
        let mut range = DateRange::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "begin" => range.begin = self.number(&child)?.unwrap_or_default(),
                "end" => range.end = self.number(&child)?.unwrap_or_default(),
                _ => self.skip(&child)?,
            }
        }
        Ok(range)
    }

    fn parse_policy_published(&mut self, element: &Child) -> Result<PolicyPublished> {
        let mut policy = PolicyPublished::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "domain" => policy.domain = self.text(&child)?,
                "adkim" => policy.adkim = self.text(&child)?.and_then(|v| v.parse().ok()),
                "aspf" => policy.aspf = self.text(&child)?.and_then(|v| v.parse().ok()),
                "p" => policy.p = self.text(&child)?.and_then(|v| v.parse().ok()),
                "sp" => policy.sp = self.text(&child)?.and_then(|v| v.parse().ok()),
                "pct" => policy.pct = self.number(&child)?,
                "fo" => policy.fo = self.text(&child)?,
                _ => self.skip(&child)?,
            }
        }
        Ok(policy)
    }

    fn parse_record(&mut self, element: &Child, index: usize) -> Result<Record> {
        let mut record = Record::default();
        let mut has_auth_results = false;
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "row" => record.row = self.parse_row(&child)?,
                "identifiers" => record.identifiers = self.parse_identifiers(&child)?,
                "auth_results" => {
                    let auth_results = self.parse_auth_results(&child, index)?;
                    record.auth_results.dkim.extend(auth_results.dkim);
                    record.auth_results.spf.extend(auth_results.spf);
                    has_auth_results = true;
                }
                _ => self.skip(&child)?,
            }
        }
        if !has_auth_results {
            return Err(malformed(format!("record {} has no <auth_results>", index + 1)));
        }
        Ok(record)
    }

    fn parse_row(&mut self, element: &Child) -> Result<Row> {
        let mut row = Row::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "source_ip" => row.source_ip = self.text(&child)?,
                "count" => row.count = self.number(&child)?,
                "policy_evaluated" => row.policy_evaluated = self.parse_policy_evaluated(&child)?,
                _ => self.skip(&child)?,
            }
        }
        Ok(row)
    }

    fn parse_policy_evaluated(&mut self, element: &Child) -> Result<PolicyEvaluated> {
        let mut evaluated = PolicyEvaluated::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "disposition" => evaluated.disposition = self.text(&child)?,
                "dkim" => evaluated.dkim = self.text(&child)?,
                "spf" => evaluated.spf = self.text(&child)?,
                _ => self.skip(&child)?,
            }
        }
        Ok(evaluated)
    }

    fn parse_identifiers(&mut self, element: &Child) -> Result<Identifiers> {
        let mut identifiers = Identifiers::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "envelope_from" => identifiers.envelope_from = self.text(&child)?,
                "header_from" => identifiers.header_from = self.text(&child)?,
                _ => self.skip(&child)?,
            }
        }
        Ok(identifiers)
    }

    fn parse_auth_results(&mut self, element: &Child, index: usize) -> Result<AuthResults> {
        let mut auth_results = AuthResults::default();
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "dkim" => auth_results.dkim.push(self.parse_auth_result(&child, index)?),
                "spf" => auth_results.spf.push(self.parse_auth_result(&child, index)?),
                _ => self.skip(&child)?,
            }
        }
        Ok(auth_results)
    }

    fn parse_auth_result(&mut self, element: &Child, index: usize) -> Result<AuthResult> {
        let mut domain = None;
        let mut selector = None;
        let mut scope = None;
        let mut result = None;
        while let Some(child) = self.next_child(element)? {
            match child.name.as_str() {
                "domain" => domain = self.text(&child)?,
                "selector" => selector = self.text(&child)?,
                "scope" => scope = self.text(&child)?,
                "result" => result = self.text(&child)?,
                _ => self.skip(&child)?,
            }
        }
        let result = result.ok_or_else(|| {
            malformed(format!(
                "record {}: <{}> auth result has no <result>",
                index + 1,
                element.name
            ))
        })?;
        Ok(AuthResult {
            domain,
            selector,
            scope,
            result,
        })
    }
}
