//! CSV ingestion for match value-sets and call-argument lookups.
//!
//! Tables are referenced by basename (the `.csv` suffix is implicit),
//! loaded once, and immutable afterwards. Integer columns can be turned
//! into an ordered value-to-row index supporting the membership and range
//! queries the rule evaluator needs.

use std::collections::{BTreeMap, HashMap};
use std::fs;

use crate::{Error, Result};

/// One loaded CSV file.
#[derive(Debug, Clone)]
pub struct CsvTable {
    pub basename: String,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    /// Load `<basename>.csv` from the working directory.
    pub fn load(basename: &str) -> Result<CsvTable> {
        let filename = format!("{}.csv", basename);
        let content = fs::read_to_string(&filename)
            .map_err(|e| Error::Load(format!("CSV file \"{}\": {}", filename, e)))?;
        let mut rows = Vec::new();
        for line in content.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            rows.push(split_row(line));
        }
        Ok(CsvTable {
            basename: basename.to_string(),
            rows,
        })
    }

    /// Number of columns, taken from the first row.
    pub fn width(&self) -> usize {
        self.rows.first().map_or(0, |r| r.len())
    }

    pub fn field(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    /// Build an integer index for `col`: value to first row holding it.
    pub fn int_index(&self, col: usize) -> Result<BTreeMap<i64, usize>> {
        let mut index = BTreeMap::new();
        for (row, fields) in self.rows.iter().enumerate() {
            let field = fields.get(col).ok_or_else(|| {
                Error::Load(format!(
                    "CSV file \"{}.csv\"; row {} has no column {}",
                    self.basename, row, col
                ))
            })?;
            let value = parse_integer(field).ok_or_else(|| {
                Error::Load(format!(
                    "CSV file \"{}.csv\"; value \"{}\" (row {}, column {}) is not an integer",
                    self.basename, field, row, col
                ))
            })?;
            index.entry(value).or_insert(row);
        }
        Ok(index)
    }
}

/// Process-wide table cache; the same basename always yields the same
/// loaded table.
#[derive(Debug, Default)]
pub struct CsvCache {
    tables: HashMap<String, CsvTable>,
}

impl CsvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or return the cached) table for `basename`.
    pub fn load(&mut self, basename: &str) -> Result<&CsvTable> {
        if !self.tables.contains_key(basename) {
            let table = CsvTable::load(basename)?;
            self.tables.insert(basename.to_string(), table);
        }
        Ok(&self.tables[basename])
    }

    pub fn get(&self, basename: &str) -> Option<&CsvTable> {
        self.tables.get(basename)
    }
}

/// Parse a decimal or `0x…` hexadecimal integer, with optional sign.
pub fn parse_integer(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        s.parse::<i64>().ok()?
    };
    Some(if neg { -value } else { value })
}

fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if field.trim().is_empty() => {
                field.clear();
                quoted = true;
            }
            ',' if !quoted => {
                fields.push(std::mem::take(&mut field).trim().to_string());
            }
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &tempfile::TempDir, basename: &str, content: &str) {
        let path = dir.path().join(format!("{}.csv", basename));
        let mut f = fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_load_and_requery() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(&dir, "hot", "0x401020,7\n0x4010a0,9\n");
        let basename = dir.path().join("hot");
        let table = CsvTable::load(basename.to_str().unwrap()).unwrap();

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.width(), 2);

        // Round trip: the stored integers come back by (column, row).
        let index = table.int_index(0).unwrap();
        assert_eq!(index.get(&0x401020), Some(&0));
        assert_eq!(index.get(&0x4010a0), Some(&1));
        assert_eq!(table.field(0, 1), Some("7"));
        assert_eq!(table.field(1, 1), Some("9"));
    }

    #[test]
    fn test_quoted_fields() {
        assert_eq!(split_row("a,\"b,c\",d"), vec!["a", "b,c", "d"]);
        assert_eq!(split_row("\"say \"\"hi\"\"\",2"), vec!["say \"hi\"", "2"]);
        assert_eq!(split_row(" 1 , 2 "), vec!["1", "2"]);
    }

    #[test]
    fn test_int_index_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(&dir, "bad", "1,x\n");
        let basename = dir.path().join("bad");
        let table = CsvTable::load(basename.to_str().unwrap()).unwrap();
        assert!(table.int_index(0).is_ok());
        assert!(table.int_index(1).is_err());
        assert!(table.int_index(5).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(CsvTable::load("/nonexistent/nope").is_err());
    }

    #[test]
    fn test_cache_dedup() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(&dir, "t", "1\n2\n");
        let basename = dir.path().join("t");
        let basename = basename.to_str().unwrap();

        let mut cache = CsvCache::new();
        cache.load(basename).unwrap();
        assert!(cache.get(basename).is_some());
        assert_eq!(cache.load(basename).unwrap().rows.len(), 2);
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("-7"), Some(-7));
        assert_eq!(parse_integer("0x40"), Some(0x40));
        assert_eq!(parse_integer("  0x40 "), Some(0x40));
        assert_eq!(parse_integer("4x0"), None);
        assert_eq!(parse_integer(""), None);
    }
}
