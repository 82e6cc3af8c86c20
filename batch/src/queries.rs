//! `query.csv` loading.
//!
//! The file has a header line followed by `id,instruction[,...]` rows.
//! Fields may be double-quoted; a quoted field can contain commas, newlines
//! and `""` escapes. Columns after the instruction are ignored.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// One problem to diagnose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: String,
    pub instruction: String,
}

pub fn load_queries(path: &Path) -> Result<Vec<Query>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read queries {}", path.display()))?;
    parse_queries(&contents).with_context(|| format!("parse queries {}", path.display()))
}

pub fn parse_queries(contents: &str) -> Result<Vec<Query>> {
    let mut queries = Vec::new();
    for (index, record) in parse_records(contents)?.into_iter().enumerate().skip(1) {
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let line = index + 1;
        let mut fields = record.into_iter();
        let id = fields.next().unwrap_or_default().trim().to_string();
        let instruction = fields.next().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            bail!("record {line}: empty id");
        }
        if instruction.is_empty() {
            bail!("record {line}: empty instruction for {id}");
        }
        rca::run::validate_id(&id).with_context(|| format!("record {line}"))?;
        if queries.iter().any(|query: &Query| query.id == id) {
            bail!("record {line}: duplicate id {id}");
        }
        queries.push(Query { id, instruction });
    }
    Ok(queries)
}

fn parse_records(contents: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = contents.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        bail!("unterminated quoted field");
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}
