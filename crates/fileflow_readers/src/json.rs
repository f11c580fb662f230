//! JSON reader.
//!
//! Resolves an optional dot-separated record path to an array and
//! yields each element as a record. Elements must be objects; the
//! first element's keys stand in for the header check.

use crate::{missing_fields, Batch, ReadError, Record, RecordReader, Result};
use fileflow_protocol::SourceConfig;
use serde_json::{Map, Value};
use std::io::Read;

pub fn open(
    source: &SourceConfig,
    stream: Box<dyn Read + Send>,
    batch_size: usize,
) -> Result<Box<dyn RecordReader + Send>> {
    let root: Value = serde_json::from_reader(stream)
        .map_err(|e| ReadError::Structure(format!("invalid json: {}", e)))?;

    let node = match &source.json.record_path {
        Some(path) => resolve_path(&root, path)?,
        None => &root,
    };
    let elements = node.as_array().ok_or_else(|| {
        ReadError::Structure(format!(
            "record path '{}' does not resolve to an array",
            source.json.record_path.as_deref().unwrap_or("$")
        ))
    })?;
    if elements.is_empty() {
        return Err(ReadError::NoDataInFile);
    }

    let first = elements[0].as_object().ok_or_else(|| {
        ReadError::Structure("record elements must be json objects".to_string())
    })?;
    let header: Vec<String> = first.keys().cloned().collect();
    let missing = missing_fields(source, &header);
    if !missing.is_empty() {
        return Err(ReadError::MissingColumns(missing));
    }

    let field_names: Vec<String> = source.fields.iter().map(|f| f.name.clone()).collect();
    let mut records = Vec::with_capacity(elements.len());
    for (offset, element) in elements.iter().enumerate() {
        let row = offset as u64 + 1;
        let object = element.as_object().ok_or_else(|| ReadError::Parse {
            row,
            message: "record element is not an object".to_string(),
        })?;
        let mut values = Map::with_capacity(field_names.len());
        for name in &field_names {
            values.insert(name.clone(), object.get(name).cloned().unwrap_or(Value::Null));
        }
        records.push(Record { row, values });
    }

    Ok(Box::new(JsonReader {
        records,
        cursor: 0,
        batch_size,
    }))
}

fn resolve_path<'a>(root: &'a Value, path: &str) -> Result<&'a Value> {
    let mut node = root;
    for segment in path.split('.') {
        node = node.get(segment).ok_or_else(|| {
            ReadError::Structure(format!("record path segment '{}' not found", segment))
        })?;
    }
    Ok(node)
}

struct JsonReader {
    records: Vec<Record>,
    cursor: usize,
    batch_size: usize,
}

impl RecordReader for JsonReader {
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
    use crate::test_support::source;
    use fileflow_protocol::FileFormat;

    fn open_json(data: &str, record_path: Option<&str>) -> Result<Box<dyn RecordReader + Send>> {
        let mut cfg = source(FileFormat::Json);
        cfg.json.record_path = record_path.map(String::from);
        open(
            &cfg,
            Box::new(std::io::Cursor::new(data.as_bytes().to_vec())),
            100,
        )
    }

    #[test]
    fn resolves_nested_record_path() {
        let data = r#"{"data": {"customers": [
            {"id": 1, "name": "ada", "age": 30},
            {"id": 2, "name": "bob", "age": null}
        ]}}"#;
        let mut reader = open_json(data, Some("data.customers")).unwrap();
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].get("id"), &Value::from(1));
        assert_eq!(batch.records[1].row, 2);
        assert_eq!(batch.records[1].get("age"), &Value::Null);
    }

    #[test]
    fn non_array_path_is_structural() {
        let err = open_json(r#"{"data": {"customers": 5}}"#, Some("data.customers")).unwrap_err();
        assert!(matches!(err, ReadError::Structure(_)));
    }

    #[test]
    fn empty_array_has_no_data() {
        let err = open_json(r#"[]"#, None).unwrap_err();
        assert!(matches!(err, ReadError::NoDataInFile));
    }

    #[test]
    fn missing_fields_in_first_record_are_reported() {
        let err = open_json(r#"[{"id": 1}]"#, None).unwrap_err();
        match err {
            ReadError::MissingColumns(cols) => {
                assert_eq!(cols, vec!["name".to_string(), "age".to_string()])
            }
            other => panic!("expected MissingColumns, got {:?}", other),
        }
    }

    #[test]
    fn later_records_may_omit_nullable_fields() {
        let data = r#"[
            {"id": 1, "name": "ada", "age": 30},
            {"id": 2, "name": "bob"}
        ]"#;
        let mut reader = open_json(data, None).unwrap();
        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(batch.records[1].get("age"), &Value::Null);
    }
}
