//! JSON stats sink, gated behind the `json-stats` feature: one JSON object
//! per line (JSON-lines), so the output stays appendable and `tail -f`able
//! like the text sink.

use std::io::Write;

use serde::Serialize;
use serde_json::{Map, Value};

use super::{StatValue, StatsEntry, StatsError, StatsSink};

pub struct JsonStatsSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonStatsSink<W> {
    pub fn new(writer: W) -> JsonStatsSink<W> {
        JsonStatsSink { writer }
    }
}

#[derive(Serialize)]
struct Record {
    instance: u32,
    name: &'static str,
    time: String,
    fields: Map<String, Value>,
}

impl<W: Write + Send> StatsSink for JsonStatsSink<W> {
    fn write_entry(&mut self, entry: &StatsEntry) -> Result<(), StatsError> {
        let mut fields = Map::new();
        for (key, value) in &entry.fields {
            fields.insert((*key).to_string(), to_json_value(value));
        }
        let record = Record { instance: entry.instance.0, name: entry.name, time: entry.time.to_string(), fields };
        let line = serde_json::to_string(&record)?;
        writeln!(self.writer, "{line}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StatsError> {
        self.writer.flush()?;
        Ok(())
    }
}

fn to_json_value(value: &StatValue) -> Value {
    match value {
        StatValue::Float(f) => serde_json::json!(f),
        StatValue::Int(i) => serde_json::json!(i),
        StatValue::Bool(b) => serde_json::json!(b),
        StatValue::Text(s) => serde_json::json!(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceId;
    use crate::time::Timespec;
    use std::collections::BTreeMap;

    #[test]
    fn emits_one_valid_json_object_per_line() {
        let mut buf = Vec::new();
        let mut sink = JsonStatsSink::new(&mut buf);
        let mut fields = BTreeMap::new();
        fields.insert("offset", StatValue::Float(1.5));
        let entry = StatsEntry { instance: InstanceId(1), name: "servo", time: Timespec::ZERO, fields };
        sink.write_entry(&entry).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let parsed: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed["instance"], 1);
        assert_eq!(parsed["name"], "servo");
        assert_eq!(parsed["fields"]["offset"], 1.5);
    }
}
