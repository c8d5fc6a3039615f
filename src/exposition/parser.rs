//! Line-oriented parser for the Prometheus text exposition format.
//!
//! The grammar is deliberately the one real node-exporter output uses:
//! `# HELP` / `# TYPE` comment lines open a metric family, every
//! following sample line belongs to it, and any other `#` comment is
//! ignored. Errors carry the 1-based line number of the offending line
//! so a scrape of one agent can be diagnosed without its payload.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::BufRead;

use super::{MetricFamily, MetricType, Sample};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read input at line {line}: {source}")]
    Read {
        line: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("expected `# TYPE <name> <type>` at line {line}")]
    MalformedTypeLine { line: usize },
    #[error("unknown metric type `{typ}` at line {line}")]
    UnknownMetricType { typ: String, line: usize },
    #[error("expected 2 or 3 sample parts, found {found} at line {line}")]
    BadSamplePartCount { found: usize, line: usize },
    #[error("unterminated label block at line {line}")]
    UnterminatedLabelBlock { line: usize },
    #[error("missing `=` in label `{label}` at line {line}")]
    MalformedLabel { label: String, line: usize },
    #[error("label value not wrapped in double quotes in `{label}` at line {line}")]
    UnquotedLabelValue { label: String, line: usize },
    #[error("cannot convert `{value}` to a float at line {line}")]
    InvalidValue { value: String, line: usize },
    #[error("cannot convert `{value}` to a millisecond timestamp at line {line}")]
    InvalidTimestamp { value: String, line: usize },
    #[error("sample before any `# TYPE` line at line {line}")]
    SampleOutsideFamily { line: usize },
}

/// Parses a whole exposition stream into its metric families, in input
/// order.
pub fn parse<R: BufRead>(reader: R) -> Result<Vec<MetricFamily>, ParseError> {
    let mut families = Vec::new();
    parse_into(reader, |family| families.push(family))?;
    Ok(families)
}

/// Parses a stream directly into a shared family mapping.
///
/// A family already present under the same name keeps its metadata and
/// has the new samples appended. When `tags` is non-empty, every
/// collected sample gets the tag pairs appended to its label list, which
/// is how per-container identity is injected without a second pass.
pub fn collect<R: BufRead>(
    reader: R,
    output: &mut HashMap<String, MetricFamily>,
    tags: &[(String, String)],
) -> Result<(), ParseError> {
    parse_into(reader, |mut family| {
        if !tags.is_empty() {
            for sample in &mut family.samples {
                for (key, value) in tags {
                    sample.push_label(key.clone(), value.clone());
                }
            }
        }
        match output.entry(family.name.clone()) {
            Entry::Occupied(existing) => existing.into_mut().samples.extend(family.samples),
            Entry::Vacant(slot) => {
                slot.insert(family);
            }
        }
    })
}

fn parse_into<R: BufRead>(
    reader: R,
    mut emit: impl FnMut(MetricFamily),
) -> Result<(), ParseError> {
    let mut current: Option<MetricFamily> = None;
    // HELP seen before its TYPE line, waiting to attach.
    let mut pending_help: Option<(String, String)> = None;
    let mut lineno = 0;

    for line in reader.lines() {
        lineno += 1;
        let line = line.map_err(|source| ParseError::Read {
            line: lineno,
            source,
        })?;
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("# HELP ") {
            let (name, help) = match rest.split_once(' ') {
                Some((name, help)) => (name, help),
                None => (rest, ""),
            };
            match current.as_mut() {
                Some(family) if family.name == name && family.help.is_none() => {
                    family.help = Some(help.to_owned());
                }
                _ => {
                    if let Some(family) = current.take() {
                        emit(family);
                    }
                    pending_help = Some((name.to_owned(), help.to_owned()));
                }
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("# TYPE ") {
            let mut parts = rest.split_whitespace();
            let (name, typ) = match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(typ), None) => (name, typ),
                _ => return Err(ParseError::MalformedTypeLine { line: lineno }),
            };
            let typ = MetricType::parse(typ).ok_or_else(|| ParseError::UnknownMetricType {
                typ: typ.to_owned(),
                line: lineno,
            })?;
            if let Some(family) = current.take() {
                emit(family);
            }
            let help = pending_help
                .take()
                .and_then(|(help_name, help)| (help_name == name).then_some(help));
            current = Some(MetricFamily::new(name, typ, help));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let sample = parse_sample_line(&line, lineno)?;
        match current.as_mut() {
            Some(family) => family.samples.push(sample),
            None => return Err(ParseError::SampleOutsideFamily { line: lineno }),
        }
    }
    if let Some(family) = current.take() {
        emit(family);
    }

    Ok(())
}

/// Parses a sample line such as
/// `http_requests_total{method="post",code="200"} 1027 1395066363000`.
///
/// Tokens split on whitespace, except that a single `{...}` label block
/// counts as one token regardless of internal whitespace.
fn parse_sample_line(line: &str, lineno: usize) -> Result<Sample, ParseError> {
    let mut parts: Vec<&str> = Vec::with_capacity(3);
    let mut label_block: Option<&str> = None;

    let mut rest = line;
    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(after_brace) = rest.strip_prefix('{') {
            let close = after_brace
                .find('}')
                .ok_or(ParseError::UnterminatedLabelBlock { line: lineno })?;
            label_block = Some(&after_brace[..close]);
            rest = &after_brace[close + 1..];
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '{')
                .unwrap_or(rest.len());
            parts.push(&rest[..end]);
            rest = &rest[end..];
        }
    }

    // Timestamp is optional, so 2 or 3 non-label tokens.
    if parts.len() < 2 || parts.len() > 3 {
        return Err(ParseError::BadSamplePartCount {
            found: parts.len(),
            line: lineno,
        });
    }

    let value = parts[1]
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidValue {
            value: parts[1].to_owned(),
            line: lineno,
        })?;
    let timestamp_ms = match parts.get(2) {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| ParseError::InvalidTimestamp {
            value: (*raw).to_owned(),
            line: lineno,
        })?),
        None => None,
    };

    let mut sample = Sample::new(parts[0], value);
    sample.timestamp_ms = timestamp_ms;
    if let Some(block) = label_block {
        parse_labels(block, &mut sample, lineno)?;
    }

    Ok(sample)
}

/// Splits the label-block interior on commas, then each label on the
/// first `=`. Values must be double quoted; the quotes are stripped and
/// no unescaping of interior characters is performed.
fn parse_labels(block: &str, sample: &mut Sample, lineno: usize) -> Result<(), ParseError> {
    if block.is_empty() {
        return Ok(());
    }
    for label in block.split(',') {
        let (name, value) = label.split_once('=').ok_or_else(|| ParseError::MalformedLabel {
            label: label.to_owned(),
            line: lineno,
        })?;
        let unquoted = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .ok_or_else(|| ParseError::UnquotedLabelValue {
                label: label.to_owned(),
                line: lineno,
            })?;
        sample.push_label(name, unquoted);
    }

    Ok(())
}
