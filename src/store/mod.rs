//! Record store
//!
//! CSV tables with one canonical schema each. Every mutation goes through
//! [`Table::update`], which holds an exclusive lock on `<table>.lock` for the
//! whole load-mutate-save cycle and replaces the table file atomically, so
//! readers never observe a half-written table and concurrent writers never
//! drop each other's updates.

pub mod records;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::HostConfig;
use records::{FileRecord, LibraryRecord, ProgramRecord, RunRecord};

/// A row type with a fixed column layout
pub trait Record: Sized {
    /// Table name used in diagnostics
    const TABLE: &'static str;
    /// Canonical column order, written as the header
    const COLUMNS: &'static [&'static str];

    fn to_row(&self) -> Vec<String>;
    fn from_row(row: &Row<'_>) -> Result<Self>;
}

/// One loaded CSV row, addressed by column name
pub struct Row<'a> {
    index: &'a HashMap<String, usize>,
    record: &'a csv::StringRecord,
}

impl<'a> Row<'a> {
    /// Cell value; a column missing from an older file reads as empty
    pub fn get(&self, column: &str) -> &'a str {
        self.index
            .get(column)
            .and_then(|&i| self.record.get(i))
            .unwrap_or("")
    }

    /// Cell value, `None` when empty
    pub fn optional(&self, column: &str) -> Option<String> {
        let value = self.get(column);
        (!value.is_empty()).then(|| value.to_string())
    }

    /// JSON cell; empty cells decode to the default value
    pub fn json<T: DeserializeOwned + Default>(&self, column: &str) -> Result<T> {
        let value = self.get(column);
        if value.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(value).with_context(|| format!("Invalid JSON in column {}", column))
    }
}

/// Result of reading a table file
struct Contents<R> {
    rows: Vec<R>,
    /// Rows kept verbatim because they did not decode
    unparsed: Vec<csv::ByteRecord>,
}

/// A CSV table of `R` rows
#[derive(Debug)]
pub struct Table<R> {
    path: PathBuf,
    lock_path: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Table<R> {
    /// Open a table, creating it with its header if missing
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        let table = Self {
            path,
            lock_path,
            _record: PhantomData,
        };

        if !table.path.exists() {
            let _lock = table.lock()?;
            if !table.path.exists() {
                debug!("Creating table {}", table.path.display());
                table.save(&[])?;
            }
        }

        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every decodable row in file order.
    ///
    /// Rows with the wrong number of cells or undecodable values are skipped
    /// with a warning instead of failing the whole load.
    pub fn load(&self) -> Result<Vec<R>> {
        Ok(self.read()?.rows)
    }

    fn read(&self) -> Result<Contents<R>> {
        let mut contents = Contents {
            rows: Vec::new(),
            unparsed: Vec::new(),
        };
        if !self.path.exists() {
            return Ok(contents);
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("Failed to open table {}", self.path.display()))?;

        let headers = reader
            .headers()
            .with_context(|| format!("Failed to read header of {}", self.path.display()))?
            .clone();
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_string(), i))
            .collect();

        for column in R::COLUMNS {
            if !index.contains_key(*column) {
                debug!("{}: column {} missing, reading as empty", R::TABLE, column);
            }
        }
        for column in headers.iter() {
            if !R::COLUMNS.contains(&column.trim()) {
                debug!("{}: dropping unknown column {}", R::TABLE, column);
            }
        }

        let mut raw = csv::ByteRecord::new();
        let mut line = 1;
        while reader
            .read_byte_record(&mut raw)
            .with_context(|| format!("Failed to read {} after row {}", self.path.display(), line))?
        {
            line += 1;

            let record = match csv::StringRecord::from_byte_record(raw.clone()) {
                Ok(record) => record,
                Err(e) => {
                    warn!("{}: keeping unreadable row {} as is: {}", R::TABLE, line, e);
                    contents.unparsed.push(raw.clone());
                    continue;
                }
            };

            if record.len() != headers.len() {
                warn!(
                    "{}: keeping row {} with {} cells as is, expected {}",
                    R::TABLE,
                    line,
                    record.len(),
                    headers.len()
                );
                contents.unparsed.push(raw.clone());
                continue;
            }

            let row = Row {
                index: &index,
                record: &record,
            };
            match R::from_row(&row) {
                Ok(parsed) => contents.rows.push(parsed),
                Err(e) => {
                    warn!("{}: keeping undecodable row {} as is: {:#}", R::TABLE, line, e);
                    // laid out in the canonical column order it is written back in
                    contents.unparsed.push(R::COLUMNS.iter().map(|c| row.get(c)).collect());
                }
            }
        }

        Ok(contents)
    }

    /// Replace the table contents (temp file + rename)
    pub fn save(&self, rows: &[R]) -> Result<()> {
        self.write(rows, &[])
    }

    /// Write `rows`, followed by rows that could not be decoded, unchanged
    fn write(&self, rows: &[R], unparsed: &[csv::ByteRecord]) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let tmp = NamedTempFile::new_in(dir).context("Failed to create temp table file")?;
        {
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_writer(tmp.as_file());
            writer.write_record(R::COLUMNS)?;
            for row in rows {
                writer.write_record(row.to_row())?;
            }
            for record in unparsed {
                writer.write_byte_record(record)?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace table {}", self.path.display()))?;

        Ok(())
    }

    /// Locked load-mutate-save cycle.
    ///
    /// Nothing is written when `mutate` fails. Rows that could not be decoded
    /// are written back untouched so a hand-edited mistake can be repaired.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut Vec<R>) -> Result<T>) -> Result<T> {
        let _lock = self.lock()?;
        let Contents { mut rows, unparsed } = self.read()?;
        let out = mutate(&mut rows)?;
        self.write(&rows, &unparsed)?;
        Ok(out)
    }

    /// First row matching `pred`
    pub fn find(&self, pred: impl Fn(&R) -> bool) -> Result<Option<R>> {
        Ok(self.load()?.into_iter().find(|r| pred(r)))
    }

    /// Exclusive advisory lock, released when the returned file is dropped
    fn lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock {}", self.lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", self.lock_path.display()))?;
        Ok(file)
    }
}

/// The four tables of a host
#[derive(Debug)]
pub struct Tables {
    pub programs: Table<ProgramRecord>,
    pub runs: Table<RunRecord>,
    pub libraries: Table<LibraryRecord>,
    pub files: Table<FileRecord>,
}

impl Tables {
    pub fn open(config: &HostConfig) -> Result<Self> {
        Ok(Self {
            programs: Table::open(config.programs_table())?,
            runs: Table::open(config.runs_table())?,
            libraries: Table::open(config.libs_table())?,
            files: Table::open(config.files_table())?,
        })
    }
}
