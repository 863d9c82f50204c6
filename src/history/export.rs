//! Serializers for history exports.

use std::io::Write;

use super::storage::{HistoryEntry, HistoryError};

pub fn write_json<W: Write>(entries: &[HistoryEntry], out: &mut W) -> Result<(), HistoryError> {
    serde_json::to_writer_pretty(&mut *out, entries)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// RFC 4180: CRLF line endings, fields quoted when they contain a comma,
/// quote or line break.
pub fn write_csv<W: Write>(entries: &[HistoryEntry], out: &mut W) -> Result<(), HistoryError> {
    out.write_all(b"id,timestamp,analysis_text,prompt\r\n")?;
    for e in entries {
        write!(
            out,
            "{},{},{},{}\r\n",
            e.id,
            csv_field(&e.timestamp),
            csv_field(&e.analysis_text),
            csv_field(&e.prompt)
        )?;
    }
    out.flush()?;
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
