//! Parquet reader.
//!
//! Streams row groups through the Arrow record batch reader and
//! re-batches to the configured size. Primitive values map to native
//! JSON shapes; dates, timestamps, and decimals come through as the
//! Arrow display strings the Validator can parse.

use crate::{missing_fields, Batch, ReadError, Record, RecordReader, Result};
use arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, LargeStringArray, RecordBatch, StringArray, UInt16Array, UInt32Array, UInt64Array,
    UInt8Array,
};
use arrow::datatypes::DataType;
use bytes::Bytes;
use fileflow_protocol::SourceConfig;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use serde_json::{Map, Value};
use std::io::Read;

pub fn open(
    source: &SourceConfig,
    mut stream: Box<dyn Read + Send>,
    batch_size: usize,
) -> Result<Box<dyn RecordReader + Send>> {
    // The parquet footer lives at the end of the stream; buffer it.
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;

    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .map_err(|e| ReadError::Structure(format!("cannot open parquet: {}", e)))?;

    let header: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let missing = missing_fields(source, &header);
    if !missing.is_empty() {
        return Err(ReadError::MissingColumns(missing));
    }
    if builder.metadata().file_metadata().num_rows() == 0 {
        return Err(ReadError::NoDataInFile);
    }

    let reader = builder
        .with_batch_size(batch_size)
        .build()
        .map_err(|e| ReadError::Structure(format!("cannot read parquet: {}", e)))?;

    Ok(Box::new(ParquetReader {
        reader,
        field_names: source.fields.iter().map(|f| f.name.clone()).collect(),
        next_row: 1,
    }))
}

struct ParquetReader {
    reader: ParquetRecordBatchReader,
    field_names: Vec<String>,
    next_row: u64,
}

impl RecordReader for ParquetReader {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let Some(batch) = self.reader.next() else {
            return Ok(None);
        };
        let batch = batch.map_err(|e| ReadError::Parse {
            row: self.next_row,
            message: e.to_string(),
        })?;

        let starting_row = self.next_row;
        let mut records = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let mut values = Map::with_capacity(self.field_names.len());
            for name in &self.field_names {
                values.insert(name.clone(), column_value(&batch, name, i));
            }
            records.push(Record {
                row: self.next_row,
                values,
            });
            self.next_row += 1;
        }
        Ok(Some(Batch {
            starting_row,
            records,
        }))
    }
}

fn column_value(batch: &RecordBatch, name: &str, i: usize) -> Value {
    let Some(column) = batch.column_by_name(name) else {
        return Value::Null;
    };
    arrow_cell(column.as_ref(), i)
}

fn arrow_cell(array: &dyn Array, i: usize) -> Value {
    if array.is_null(i) {
        return Value::Null;
    }

    macro_rules! primitive {
        ($ty:ty) => {
            array
                .as_any()
                .downcast_ref::<$ty>()
                .map(|a| Value::from(a.value(i)))
                .unwrap_or(Value::Null)
        };
    }

    match array.data_type() {
        DataType::Boolean => primitive!(BooleanArray),
        DataType::Int8 => primitive!(Int8Array),
        DataType::Int16 => primitive!(Int16Array),
        DataType::Int32 => primitive!(Int32Array),
        DataType::Int64 => primitive!(Int64Array),
        DataType::UInt8 => primitive!(UInt8Array),
        DataType::UInt16 => primitive!(UInt16Array),
        DataType::UInt32 => primitive!(UInt32Array),
        DataType::UInt64 => primitive!(UInt64Array),
        DataType::Float32 => primitive!(Float32Array),
        DataType::Float64 => primitive!(Float64Array),
        DataType::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .map(|a| Value::String(a.value(i).to_string()))
            .unwrap_or(Value::Null),
        DataType::LargeUtf8 => array
            .as_any()
            .downcast_ref::<LargeStringArray>()
            .map(|a| Value::String(a.value(i).to_string()))
            .unwrap_or(Value::Null),
        // Dates, timestamps, decimals: the display form is already the
        // canonical string the Validator parses.
        _ => arrow::util::display::array_value_to_string(array, i)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}
