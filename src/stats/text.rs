//! Plain-text stats sink: one line per entry, `key=value` fields in
//! insertion order, the format every deployment gets even without
//! `json-stats`.

use std::io::Write;

use super::{StatValue, StatsEntry, StatsError, StatsSink};

pub struct TextStatsSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> TextStatsSink<W> {
    pub fn new(writer: W) -> TextStatsSink<W> {
        TextStatsSink { writer }
    }
}

impl<W: Write + Send> StatsSink for TextStatsSink<W> {
    fn write_entry(&mut self, entry: &StatsEntry) -> Result<(), StatsError> {
        write!(self.writer, "{} instance={} time={}", entry.name, entry.instance.0, entry.time)?;
        for (key, value) in &entry.fields {
            write!(self.writer, " {key}={}", format_value(value))?;
        }
        writeln!(self.writer)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StatsError> {
        self.writer.flush()?;
        Ok(())
    }
}

fn format_value(value: &StatValue) -> String {
    match value {
        StatValue::Float(f) => format!("{f:.9}"),
        StatValue::Int(i) => i.to_string(),
        StatValue::Bool(b) => b.to_string(),
        StatValue::Text(s) => s.clone(),
    }
}
