//! Shared libraries linked into program environments with `conda develop`

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::archive::{extract_archive, ArchiveKind};
use crate::error::HostError;
use crate::host::Host;
use crate::store::records::{LibraryRecord, LibraryStatus};
use crate::util::{file_stamp, format_size, is_safe_name, remove_tree, sanitize_name, split_extension, timestamp};

#[derive(Debug, Clone, PartialEq)]
pub struct LibraryRequest {
    pub name: String,
    pub archive: PathBuf,
    /// Directory inside the extracted library handed to `conda develop`
    pub path_to_exec: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryDeletion {
    /// Files and record are gone
    Removed,
    /// Still linked into these programs; only marked `deleted`
    MarkedDeleted { used_by: Vec<String> },
}

impl Host {
    pub fn add_library(&self, request: LibraryRequest) -> Result<LibraryRecord> {
        let name = sanitize_name(&request.name);
        if !is_safe_name(&name) {
            return Err(HostError::Rejected(format!("Invalid library name: {:?}", request.name)).into());
        }

        let orig_filename = request
            .archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if ArchiveKind::from_name(&orig_filename).is_none() {
            return Err(HostError::Rejected(format!("Unsupported archive type: {}", orig_filename)).into());
        }
        let size = fs::metadata(&request.archive)
            .with_context(|| format!("Failed to read {}", request.archive.display()))?
            .len();

        let (stem, ext) = split_extension(&orig_filename);
        let stored_name = format!("{}_{}{}", sanitize_name(stem), file_stamp(), ext);
        let stored = self.config.libs_dir().join(&stored_name);
        let target = self.config.libs_dir().join(&name);

        let record = LibraryRecord {
            name: name.clone(),
            path_to_exec: request.path_to_exec.trim().trim_matches('/').to_string(),
            upload_date: timestamp(),
            zip_path: format!("libs/{}", stored_name),
            orig_filename,
            status: LibraryStatus::Installed,
            size: format_size(size),
            comment: crate::util::one_line(&request.comment),
            used_by: Vec::new(),
        };

        self.tables.libraries.update(|rows| {
            if rows.iter().any(|r| r.name == name) {
                return Err(HostError::Rejected(format!("Library name {} is already in use", name)).into());
            }
            match fs::create_dir(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(HostError::Rejected(format!("Library name {} is already in use", name)).into())
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to create {}", target.display())),
            }

            let unpacked = fs::copy(&request.archive, &stored)
                .with_context(|| format!("Failed to store {}", request.archive.display()))
                .and_then(|_| extract_archive(&stored, &target));
            if let Err(e) = unpacked {
                let _ = remove_tree(&target);
                let _ = fs::remove_file(&stored);
                return Err(e.context(format!("Failed to unpack library {}", name)));
            }

            rows.push(record.clone());
            Ok(())
        })?;

        info!("Library {} added ({})", name, record.size);
        Ok(record)
    }

    /// Hard delete an unused library; a library still linked somewhere is
    /// only marked `deleted`.
    pub fn delete_library(&self, name: &str) -> Result<LibraryDeletion> {
        let root = self.config.root.clone();
        let target = self.config.libs_dir().join(name);

        let outcome = self.tables.libraries.update(|rows| {
            let index = rows
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| HostError::Rejected(format!("Library {} not found", name)))?;

            if !rows[index].used_by.is_empty() {
                rows[index].status = LibraryStatus::Deleted;
                return Ok(LibraryDeletion::MarkedDeleted {
                    used_by: rows[index].used_by.clone(),
                });
            }

            let record = rows.remove(index);
            if target.exists() {
                remove_tree(&target)?;
            }
            let archive = root.join(&record.zip_path);
            if let Err(e) = fs::remove_file(&archive) {
                warn!("Failed to remove {}: {}", archive.display(), e);
            }
            Ok(LibraryDeletion::Removed)
        })?;

        match &outcome {
            LibraryDeletion::Removed => info!("Library {} deleted", name),
            LibraryDeletion::MarkedDeleted { used_by } => {
                info!("Library {} marked deleted, still used by {}", name, used_by.join(", "))
            }
        }
        Ok(outcome)
    }
}
