//! Serializer for text format version 0.0.4.
//!
//! Formatting matches the upstream Go exposition writer byte for byte:
//! the special float literals and the escaping rules here are what
//! downstream scrapers round-trip against.

use std::io::Write;

use super::MetricFamily;

/// Writes each family as `# HELP`, `# TYPE`, then one line per sample.
///
/// Families are emitted in iteration order; the caller decides what
/// order is stable for its use case. The `# HELP` line is skipped for
/// families that never carried help text, which keeps
/// `write_text(parse(input))` line-for-line identical to `input`.
pub fn write_text<'a, W: Write>(
    writer: &mut W,
    families: impl IntoIterator<Item = &'a MetricFamily>,
) -> std::io::Result<()> {
    for family in families {
        if let Some(help) = &family.help {
            write!(writer, "# HELP {} ", family.name)?;
            write_escaped_help(writer, help)?;
            writeln!(writer)?;
        }
        writeln!(writer, "# TYPE {} {}", family.name, family.typ.as_str())?;
        for sample in &family.samples {
            writer.write_all(sample.name.as_bytes())?;
            if !sample.label_names.is_empty() {
                writer.write_all(b"{")?;
                for (i, (name, value)) in sample
                    .label_names
                    .iter()
                    .zip(sample.label_values.iter())
                    .enumerate()
                {
                    if i > 0 {
                        writer.write_all(b",")?;
                    }
                    write!(writer, "{name}=\"")?;
                    write_escaped_label_value(writer, value)?;
                    writer.write_all(b"\"")?;
                }
                writer.write_all(b"}")?;
            }
            write!(writer, " {}", format_value(sample.value))?;
            if let Some(ts) = sample.timestamp_ms {
                write!(writer, " {ts}")?;
            }
            writeln!(writer)?;
        }
    }

    Ok(())
}

/// Renders a sample value the way the Go exposition writer does.
///
/// `+Inf`, `-Inf` and `NaN` use their exposition spellings, the exact
/// literals 0, 1 and -1 render without a decimal point, and everything
/// else uses the shortest decimal representation that re-parses to the
/// same f64.
pub fn format_value(value: f64) -> String {
    if value == f64::INFINITY {
        return "+Inf".to_owned();
    }
    if value == f64::NEG_INFINITY {
        return "-Inf".to_owned();
    }
    if value.is_nan() {
        return "NaN".to_owned();
    }
    if value == 1.0 {
        return "1".to_owned();
    }
    if value == 0.0 {
        return "0".to_owned();
    }
    if value == -1.0 {
        return "-1".to_owned();
    }
    format!("{value}")
}

// Help text: `\` -> `\\`, newline -> `\n`.
fn write_escaped_help<W: Write>(writer: &mut W, s: &str) -> std::io::Result<()> {
    for c in s.chars() {
        match c {
            '\\' => writer.write_all(b"\\\\")?,
            '\n' => writer.write_all(b"\\n")?,
            _ => write!(writer, "{c}")?,
        }
    }
    Ok(())
}

// Label values additionally escape the double quote.
fn write_escaped_label_value<W: Write>(writer: &mut W, s: &str) -> std::io::Result<()> {
    for c in s.chars() {
        match c {
            '\\' => writer.write_all(b"\\\\")?,
            '"' => writer.write_all(b"\\\"")?,
            '\n' => writer.write_all(b"\\n")?,
            _ => write!(writer, "{c}")?,
        }
    }
    Ok(())
}
