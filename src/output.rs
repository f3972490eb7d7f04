use std::io::{self, Write};

use serde::Serialize;

use crate::app::{DeleteResult, QueryResult};
use crate::indexer::IndexSummary;
use crate::record::Record;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_record(record: &Record) -> io::Result<()> {
        Self::print_json(record)
    }

    pub fn print_missing(key: &str) -> io::Result<()> {
        Self::print_json(&serde_json::json!({ "key": key, "found": false }))
    }

    pub fn print_delete(result: &DeleteResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_query(result: &QueryResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_index(result: &IndexSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
