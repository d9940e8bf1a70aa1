// ABOUTME: Parquet staging format: one Arrow record batch per snapshot
// ABOUTME: Infers an Arrow type per column and maps Arrow arrays back to cell values

use crate::table::{TabularBuffer, Value};
use anyhow::{Context, Result};
use arrow::array::{
    Array, ArrayRef, AsArray, BinaryBuilder, BooleanBuilder, Float64Builder, Int64Builder,
    StringBuilder,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

pub fn write_parquet(path: &Path, buffer: &TabularBuffer) -> Result<()> {
    let fields: Vec<Field> = buffer
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, name)| Field::new(name, infer_type(buffer, idx), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), None)
        .context("Failed to start Parquet writer")?;

    if !buffer.is_empty() {
        let arrays = (0..buffer.columns().len())
            .map(|idx| build_array(buffer, idx, schema.field(idx).data_type()))
            .collect::<Vec<_>>();
        let batch = RecordBatch::try_new(schema.clone(), arrays)
            .context("Failed to assemble record batch")?;
        writer.write(&batch).context("Failed to write record batch")?;
    }

    writer.close().context("Failed to finish Parquet file")?;
    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<TabularBuffer> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("{} is not a readable Parquet file", path.display()))?;

    let columns: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder.build()?;

    let mut buffer = TabularBuffer::new(columns);
    for batch in reader {
        let batch = batch.context("Failed to decode record batch")?;
        let decoded = batch
            .columns()
            .iter()
            .map(decode_array)
            .collect::<Result<Vec<_>>>()?;

        for row in 0..batch.num_rows() {
            buffer.push_row(decoded.iter().map(|col| col[row].clone()).collect())?;
        }
    }

    Ok(buffer)
}

/// Pick the narrowest Arrow type every non-null cell of a column fits
fn infer_type(buffer: &TabularBuffer, idx: usize) -> DataType {
    let mut inferred: Option<DataType> = None;

    for row in buffer.rows() {
        let cell_type = match &row[idx] {
            Value::Null => continue,
            Value::Bool(_) => DataType::Boolean,
            Value::Int(_) => DataType::Int64,
            Value::Float(_) => DataType::Float64,
            Value::Text(_) => DataType::Utf8,
            Value::Bytes(_) => DataType::Binary,
        };

        inferred = Some(match (inferred, cell_type) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(DataType::Int64), DataType::Float64)
            | (Some(DataType::Float64), DataType::Int64) => DataType::Float64,
            _ => return DataType::Utf8,
        });
    }

    inferred.unwrap_or(DataType::Utf8)
}

fn build_array(buffer: &TabularBuffer, idx: usize, data_type: &DataType) -> ArrayRef {
    let cells = buffer.rows().iter().map(|row| &row[idx]);

    match data_type {
        DataType::Int64 => {
            let mut builder = Int64Builder::new();
            for cell in cells {
                builder.append_option(cell.as_i64());
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::new();
            for cell in cells {
                builder.append_option(cell.as_f64());
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::new();
            for cell in cells {
                builder.append_option(cell.as_bool());
            }
            Arc::new(builder.finish())
        }
        DataType::Binary => {
            let mut builder = BinaryBuilder::new();
            for cell in cells {
                builder.append_option(cell.as_bytes());
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = StringBuilder::new();
            for cell in cells {
                builder.append_option(cell.to_text());
            }
            Arc::new(builder.finish())
        }
    }
}

fn decode_array(array: &ArrayRef) -> Result<Vec<Value>> {
    let len = array.len();

    match array.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => {
            let widened = cast(array, &DataType::Int64)?;
            let ints = widened.as_primitive::<Int64Type>();
            Ok((0..len)
                .map(|i| nullable(ints, i, || Value::Int(ints.value(i))))
                .collect())
        }
        DataType::UInt64 | DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let widened = cast(array, &DataType::Float64)?;
            let floats = widened.as_primitive::<Float64Type>();
            Ok((0..len)
                .map(|i| nullable(floats, i, || Value::Float(floats.value(i))))
                .collect())
        }
        DataType::Boolean => {
            let bools = array.as_boolean();
            Ok((0..len)
                .map(|i| nullable(bools, i, || Value::Bool(bools.value(i))))
                .collect())
        }
        DataType::Utf8 | DataType::LargeUtf8 => {
            let widened = cast(array, &DataType::Utf8)?;
            let strings = widened.as_string::<i32>();
            Ok((0..len)
                .map(|i| nullable(strings, i, || Value::Text(strings.value(i).to_string())))
                .collect())
        }
        DataType::Binary | DataType::LargeBinary => {
            let widened = cast(array, &DataType::Binary)?;
            let bytes = widened.as_binary::<i32>();
            Ok((0..len)
                .map(|i| nullable(bytes, i, || Value::Bytes(bytes.value(i).to_vec())))
                .collect())
        }
        // dates, decimals and the rest come back in their display form
        _ => (0..len)
            .map(|i| {
                if array.is_null(i) {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Text(array_value_to_string(array, i)?))
                }
            })
            .collect(),
    }
}

fn nullable<A: Array + ?Sized>(array: &A, i: usize, value: impl FnOnce() -> Value) -> Value {
    if array.is_null(i) {
        Value::Null
    } else {
        value()
    }
}
