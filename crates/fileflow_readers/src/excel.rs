//! Excel reader (xlsx/xls via calamine).
//!
//! The configured sheet (or the first one) is materialised up front;
//! calamine ranges are not streamable. Date serials are converted to
//! ISO strings at read time so downstream validation sees the same
//! shapes as CSV.

use crate::{missing_fields, Batch, ReadError, Record, RecordReader, Result};
use calamine::{open_workbook_auto_from_rs, Data, Range, Reader};
use fileflow_protocol::SourceConfig;
use serde_json::{Map, Value};
use std::io::{Cursor, Read};

pub fn open(
    source: &SourceConfig,
    mut stream: Box<dyn Read + Send>,
    batch_size: usize,
) -> Result<Box<dyn RecordReader + Send>> {
    // Workbooks need seekable input; buffer the stream.
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| ReadError::Structure(format!("cannot open workbook: {}", e)))?;

    let range: Range<Data> = match &source.excel.sheet {
        Some(name) => workbook
            .worksheet_range(name)
            .map_err(|e| ReadError::Structure(format!("sheet '{}': {}", name, e)))?,
        None => {
            let first = workbook
                .sheet_names()
                .first()
                .cloned()
                .ok_or_else(|| ReadError::Structure("workbook has no sheets".to_string()))?;
            workbook
                .worksheet_range(&first)
                .map_err(|e| ReadError::Structure(format!("sheet '{}': {}", first, e)))?
        }
    };

    let mut rows = range.rows().skip(source.excel.skip_rows);
    let header: Vec<String> = rows
        .next()
        .ok_or(ReadError::MissingHeader)?
        .iter()
        .map(|cell| cell.to_string().trim().to_string())
        .collect();
    if header.iter().all(|h| h.is_empty()) {
        return Err(ReadError::MissingHeader);
    }
    let missing = missing_fields(source, &header);
    if !missing.is_empty() {
        return Err(ReadError::MissingColumns(missing));
    }

    let columns: Vec<(String, usize)> = source
        .fields
        .iter()
        .map(|f| {
            let index = header.iter().position(|h| h == &f.name).unwrap_or(usize::MAX);
            (f.name.clone(), index)
        })
        .collect();

    let records: Vec<Record> = rows
        .enumerate()
        .map(|(offset, row)| {
            let mut values = Map::with_capacity(columns.len());
            for (name, index) in &columns {
                values.insert(name.clone(), cell_to_value(row.get(*index)));
            }
            Record {
                row: offset as u64 + 1,
                values,
            }
        })
        .collect();

    if records.is_empty() {
        return Err(ReadError::NoDataInFile);
    }

    Ok(Box::new(ExcelReader {
        records,
        cursor: 0,
        batch_size,
    }))
}

fn cell_to_value(cell: Option<&Data>) -> Value {
    match cell {
        None | Some(Data::Empty) => Value::Null,
        Some(Data::String(s)) => Value::String(s.clone()),
        Some(Data::Float(f)) => Value::from(*f),
        Some(Data::Int(i)) => Value::from(*i),
        Some(Data::Bool(b)) => Value::from(*b),
        // Date serial -> ISO. Midnight-exact values read as dates.
        Some(Data::DateTime(serial)) => match serial.as_datetime() {
            Some(dt) if dt.time() == chrono::NaiveTime::MIN => {
                Value::String(dt.date().format("%Y-%m-%d").to_string())
            }
            Some(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
            None => Value::Null,
        },
        Some(Data::DateTimeIso(s)) | Some(Data::DurationIso(s)) => Value::String(s.clone()),
        Some(Data::Error(_)) => Value::Null,
    }
}

struct ExcelReader {
    records: Vec<Record>,
    cursor: usize,
    batch_size: usize,
}

impl RecordReader for ExcelReader {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.records.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.records.len());
        let records = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(Batch {
            starting_row: records[0].row,
            records,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_midnight_serial_reads_as_date() {
        // 2024-03-01 00:00 as an Excel serial.
        let serial = calamine::ExcelDateTime::new(
            45352.0,
            calamine::ExcelDateTimeType::DateTime,
            false,
        );
        let value = cell_to_value(Some(&Data::DateTime(serial)));
        assert_eq!(value, Value::String("2024-03-01".to_string()));
    }

    #[test]
    fn empty_cells_are_null() {
        assert_eq!(cell_to_value(None), Value::Null);
        assert_eq!(cell_to_value(Some(&Data::Empty)), Value::Null);
    }
}
