// ABOUTME: JSON staging format: an array of row objects keyed by column name
// ABOUTME: Binary cells become {"_type": "binary", "data": <base64>} objects

use crate::table::{TabularBuffer, Value};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Map, Value as JsonValue};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub fn write_json(path: &Path, buffer: &TabularBuffer) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let records: Vec<JsonValue> = buffer
        .rows()
        .iter()
        .map(|row| {
            let object: Map<String, JsonValue> = buffer
                .columns()
                .iter()
                .zip(row)
                .map(|(column, value)| (column.clone(), value_to_json(value)))
                .collect();
            JsonValue::Object(object)
        })
        .collect();

    serde_json::to_writer_pretty(&mut writer, &records)
        .with_context(|| format!("Failed to serialize rows to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Read an array of objects back into a buffer
///
/// Columns are the union of keys in first-seen order; a key missing from some
/// object reads as null there.
pub fn read_json(path: &Path) -> Result<TabularBuffer> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let document: JsonValue = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {} as JSON", path.display()))?;

    let JsonValue::Array(records) = document else {
        bail!("Expected a JSON array of row objects");
    };

    let mut objects = Vec::with_capacity(records.len());
    let mut columns: Vec<String> = Vec::new();
    for (idx, record) in records.into_iter().enumerate() {
        let JsonValue::Object(object) = record else {
            bail!("Row {} is not a JSON object", idx);
        };
        for key in object.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
        objects.push(object);
    }

    let mut buffer = TabularBuffer::new(columns.clone());
    for (idx, mut object) in objects.into_iter().enumerate() {
        let row = columns
            .iter()
            .map(|column| match object.remove(column) {
                Some(cell) => json_to_value(cell),
                None => Ok(Value::Null),
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid cell in row {}", idx))?;
        buffer.push_row(row)?;
    }

    Ok(buffer)
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => json!(i),
        // NaN and infinities have no JSON number form
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(f.to_string())),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Bytes(bytes) => json!({
            "_type": "binary",
            "data": STANDARD.encode(bytes),
        }),
    }
}

fn json_to_value(cell: JsonValue) -> Result<Value> {
    Ok(match cell {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => Value::Text(s),
        JsonValue::Object(object) if is_binary(&object) => {
            let data = object
                .get("data")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            let bytes = STANDARD
                .decode(data)
                .context("Binary cell holds invalid base64")?;
            Value::Bytes(bytes)
        }
        // nested documents (e.g. from JSON columns) travel as their text form
        other => Value::Text(other.to_string()),
    })
}

fn is_binary(object: &Map<String, JsonValue>) -> bool {
    object.get("_type").and_then(JsonValue::as_str) == Some("binary")
}
