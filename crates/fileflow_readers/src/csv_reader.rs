//! CSV reader.
//!
//! Honours the configured delimiter and header skip count. Cells come
//! through as raw strings; the Validator owns type coercion. Short rows
//! yield nulls for the missing columns so the row can still be
//! attributed in the DLQ.

use crate::{missing_fields, Batch, ReadError, Record, RecordReader, Result};
use fileflow_protocol::SourceConfig;
use serde_json::{Map, Value};
use std::io::Read;

pub fn open(
    source: &SourceConfig,
    stream: Box<dyn Read + Send>,
    batch_size: usize,
) -> Result<Box<dyn RecordReader + Send>> {
    Ok(Box::new(CsvReader::new(source, stream, batch_size)?))
}

struct CsvReader {
    reader: csv::Reader<Box<dyn Read + Send>>,
    /// Schema field name and its column index in the file.
    columns: Vec<(String, usize)>,
    batch_size: usize,
    next_row: u64,
    produced_any: bool,
    done: bool,
}

impl CsvReader {
    fn new(source: &SourceConfig, stream: Box<dyn Read + Send>, batch_size: usize) -> Result<Self> {
        match source.csv.encoding.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" | "ascii" => {}
            other => return Err(ReadError::Encoding(other.to_string())),
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(source.csv.delimiter as u8)
            .has_headers(false)
            .flexible(true)
            .from_reader(stream);

        let mut record = csv::ByteRecord::new();
        for _ in 0..source.csv.skip_rows {
            if !read_byte_record(&mut reader, &mut record, 0)? {
                return Err(ReadError::MissingHeader);
            }
        }

        if !read_byte_record(&mut reader, &mut record, 0)? {
            return Err(ReadError::MissingHeader);
        }
        let header: Vec<String> = record
            .iter()
            .map(|cell| String::from_utf8_lossy(cell).trim().to_string())
            .collect();
        if header.iter().all(|h| h.is_empty()) {
            return Err(ReadError::MissingHeader);
        }

        let missing = missing_fields(source, &header);
        if !missing.is_empty() {
            return Err(ReadError::MissingColumns(missing));
        }

        let columns = source
            .fields
            .iter()
            .map(|f| {
                let index = header.iter().position(|h| h == &f.name).unwrap_or(usize::MAX);
                (f.name.clone(), index)
            })
            .collect();

        Ok(Self {
            reader,
            columns,
            batch_size,
            next_row: 1,
            produced_any: false,
            done: false,
        })
    }
}

impl RecordReader for CsvReader {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.done {
            return Ok(None);
        }

        let starting_row = self.next_row;
        let mut records = Vec::new();
        let mut record = csv::ByteRecord::new();
        while records.len() < self.batch_size {
            if !read_byte_record(&mut self.reader, &mut record, self.next_row)? {
                self.done = true;
                break;
            }
            let mut values = Map::with_capacity(self.columns.len());
            for (name, index) in &self.columns {
                let value = record
                    .get(*index)
                    .map(|cell| Value::String(String::from_utf8_lossy(cell).to_string()))
                    .unwrap_or(Value::Null);
                values.insert(name.clone(), value);
            }
            records.push(Record {
                row: self.next_row,
                values,
            });
            self.next_row += 1;
        }

        if records.is_empty() {
            if !self.produced_any {
                return Err(ReadError::NoDataInFile);
            }
            return Ok(None);
        }
        self.produced_any = true;
        Ok(Some(Batch {
            starting_row,
            records,
        }))
    }
}

fn read_byte_record(
    reader: &mut csv::Reader<Box<dyn Read + Send>>,
    record: &mut csv::ByteRecord,
    row: u64,
) -> Result<bool> {
    reader.read_byte_record(record).map_err(|e| ReadError::Parse {
        row,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::source;
    use fileflow_protocol::FileFormat;

    fn open_csv(data: &str, batch_size: usize) -> Result<Box<dyn RecordReader + Send>> {
        open(
            &source(FileFormat::Csv),
            Box::new(std::io::Cursor::new(data.to_string().into_bytes())),
            batch_size,
        )
    }

    #[test]
    fn reads_rows_in_order_with_row_numbers() {
        let mut reader = open_csv("id,name,age\n1,ada,30\n2,bob,\n", 100).unwrap();
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.starting_row, 1);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].get("id"), &Value::String("1".into()));
        assert_eq!(batch.records[1].row, 2);
        assert_eq!(batch.records[1].get("age"), &Value::String("".into()));
        assert!(reader.next_batch().unwrap().is_none());
    }

    #[test]
    fn batches_respect_the_size_bound() {
        let mut reader = open_csv("id,name,age\n1,a,1\n2,b,2\n3,c,3\n", 2).unwrap();
        let first = reader.next_batch().unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let second = reader.next_batch().unwrap().unwrap();
        assert_eq!(second.starting_row, 3);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn missing_column_is_reported() {
        let err = open_csv("id,name\n1,a\n", 100).unwrap_err();
        match err {
            ReadError::MissingColumns(cols) => assert_eq!(cols, vec!["age".to_string()]),
            other => panic!("expected MissingColumns, got {:?}", other),
        }
    }

    #[test]
    fn empty_file_has_no_header() {
        assert!(matches!(
            open_csv("", 100).unwrap_err(),
            ReadError::MissingHeader
        ));
    }

    #[test]
    fn header_only_file_has_no_data() {
        let mut reader = open_csv("id,name,age\n", 100).unwrap();
        assert!(matches!(
            reader.next_batch().unwrap_err(),
            ReadError::NoDataInFile
        ));
    }

    #[test]
    fn skip_rows_moves_the_header_down() {
        let mut cfg = source(FileFormat::Csv);
        cfg.csv.skip_rows = 1;
        let data = "junk line,,\nid,name,age\n7,g,1\n";
        let mut reader = open(
            &cfg,
            Box::new(std::io::Cursor::new(data.as_bytes().to_vec())),
            100,
        )
        .unwrap();
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.records[0].get("id"), &Value::String("7".into()));
    }

    #[test]
    fn short_rows_pad_with_nulls() {
        let mut reader = open_csv("id,name,age\n1,ada\n", 100).unwrap();
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.records[0].get("age"), &Value::Null);
    }
}
