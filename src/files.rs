//! Registered files that runs can use as inputs without uploading them again

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::HostError;
use crate::host::Host;
use crate::store::records::FileRecord;
use crate::util::{format_size, is_safe_name, one_line, sanitize_name, timestamp};

/// Hex SHA-256 of a file's content
pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn rejected(message: String) -> anyhow::Error {
    HostError::Rejected(message).into()
}

impl Host {
    /// Copy `source` into the files area. Identical content is only stored once.
    pub fn upload_file(&self, source: &Path, comment: &str) -> Result<FileRecord> {
        let filename = source
            .file_name()
            .map(|n| sanitize_name(&n.to_string_lossy()))
            .unwrap_or_default();
        if !is_safe_name(&filename) {
            return Err(rejected(format!("Invalid file name: {}", source.display())));
        }

        let hash = file_hash(source)?;
        let size = fs::metadata(source)?.len();
        let target = self.config.files_dir().join(&filename);

        let record = FileRecord {
            filename: filename.clone(),
            upload_date: timestamp(),
            size: format_size(size),
            hash: Some(hash.clone()),
            comment: one_line(comment),
            used_by: Vec::new(),
            dir: None,
        };

        self.tables.files.update(|rows| {
            if rows.iter().any(|r| r.filename == filename) {
                return Err(rejected(format!("A file named {} is already registered", filename)));
            }
            if let Some(same) = rows.iter().find(|r| r.hash.as_deref() == Some(hash.as_str())) {
                return Err(rejected(format!(
                    "The same content is already registered as {}",
                    same.filename
                )));
            }
            fs::copy(source, &target)
                .with_context(|| format!("Failed to copy {} into the files area", source.display()))?;
            rows.push(record.clone());
            Ok(())
        })?;

        info!("File {} uploaded ({})", filename, record.size);
        Ok(record)
    }

    /// Register a file that stays where it is
    pub fn register_path(&self, path: &Path, comment: &str) -> Result<FileRecord> {
        if !path.is_absolute() || !path.is_file() {
            return Err(rejected(format!("{} is not an existing absolute file path", path.display())));
        }
        let (Some(name), Some(dir)) = (path.file_name(), path.parent()) else {
            return Err(rejected(format!("Cannot register {}", path.display())));
        };
        let filename = name.to_string_lossy().to_string();

        let record = FileRecord {
            filename: filename.clone(),
            upload_date: timestamp(),
            size: format_size(fs::metadata(path)?.len()),
            hash: None,
            comment: one_line(comment),
            used_by: Vec::new(),
            dir: Some(dir.display().to_string()),
        };

        self.tables.files.update(|rows| {
            if rows.iter().any(|r| r.filename == filename) {
                return Err(rejected(format!("A file named {} is already registered", filename)));
            }
            rows.push(record.clone());
            Ok(())
        })?;

        info!("Registered {}", path.display());
        Ok(record)
    }

    /// Remove a registration; uploaded content is deleted with it
    pub fn delete_file(&self, filename: &str) -> Result<()> {
        let files_dir = self.config.files_dir();
        self.tables.files.update(|rows| {
            let index = rows
                .iter()
                .position(|r| r.filename == filename)
                .ok_or_else(|| rejected(format!("File {} is not registered", filename)))?;
            if !rows[index].used_by.is_empty() {
                return Err(rejected(format!(
                    "File {} is used by runs: {}",
                    filename,
                    rows[index].used_by.join(", ")
                )));
            }

            let record = rows.remove(index);
            if record.dir.is_none() {
                let path = record.path(&files_dir);
                if path.exists() {
                    fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                }
            }
            Ok(())
        })?;
        info!("File {} deleted", filename);
        Ok(())
    }

    /// Record that `run_id` reads `filename`; returns its location
    pub(crate) fn add_file_user(&self, filename: &str, run_id: &str) -> Result<Option<PathBuf>> {
        let files_dir = self.config.files_dir();
        self.tables.files.update(|rows| {
            let Some(row) = rows.iter_mut().find(|r| r.filename == filename) else {
                return Ok(None);
            };
            if !row.used_by.iter().any(|u| u == run_id) {
                row.used_by.push(run_id.to_string());
            }
            Ok(Some(row.path(&files_dir)))
        })
    }

    /// Drop every reference held by `run_id`
    pub(crate) fn release_run_files(&self, run_id: &str) -> Result<()> {
        self.tables.files.update(|rows| {
            for row in rows.iter_mut() {
                row.used_by.retain(|u| u != run_id);
            }
            Ok(())
        })
    }
}
