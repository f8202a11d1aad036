//! Row types of the four host tables

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use super::{Record, Row};

/// Identifier of a run, as stored in back-references and archive names
pub fn run_id(program: &str, purpose: &str) -> String {
    format!("{}__{}", program, purpose)
}

fn json_cell<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn pid_cell(pid: Option<u32>) -> String {
    pid.map(|p| p.to_string()).unwrap_or_default()
}

fn parse_pid(row: &Row<'_>) -> Result<Option<u32>> {
    row.optional("PID")
        .map(|p| {
            // older tables wrote floats
            let p = p.trim_end_matches(".0");
            p.parse::<u32>().with_context(|| format!("Invalid PID {}", p))
        })
        .transpose()
}

/// Lifecycle of an installed program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramStatus {
    Installing,
    GettingFiles,
    CreatingEnv,
    InstallingPackages,
    RunningSelfTest,
    Archiving,
    Installed,
    /// `Installed with error (<code>)`
    Failed(u8),
    UninstallError,
}

impl ProgramStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgramStatus::Installed | ProgramStatus::Failed(_) | ProgramStatus::UninstallError
        )
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramStatus::Installing => write!(f, "installing"),
            ProgramStatus::GettingFiles => write!(f, "getting the files"),
            ProgramStatus::CreatingEnv => write!(f, "creating conda env"),
            ProgramStatus::InstallingPackages => write!(f, "installing packages"),
            ProgramStatus::RunningSelfTest => write!(f, "running self-test"),
            ProgramStatus::Archiving => write!(f, "creating the zip from repo"),
            ProgramStatus::Installed => write!(f, "Installed"),
            ProgramStatus::Failed(code) => write!(f, "Installed with error ({})", code),
            ProgramStatus::UninstallError => write!(f, "program uninstall error"),
        }
    }
}

impl FromStr for ProgramStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "installing" => ProgramStatus::Installing,
            "getting the files" => ProgramStatus::GettingFiles,
            "creating conda env" => ProgramStatus::CreatingEnv,
            "installing packages" => ProgramStatus::InstallingPackages,
            "running self-test" => ProgramStatus::RunningSelfTest,
            "creating the zip from repo" => ProgramStatus::Archiving,
            "Installed" => ProgramStatus::Installed,
            "program uninstall error" => ProgramStatus::UninstallError,
            other => {
                let code = other
                    .strip_prefix("Installed with error (")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| anyhow!("Unknown program status: {}", other))?;
                ProgramStatus::Failed(code.parse()?)
            }
        })
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    SetUp,
    /// `queue <rank>`, ranks dense from 1
    Queued(u32),
    Running,
    Completed,
    /// `Completed with error <code>`
    Failed(u8),
    Terminated,
    DeleteError,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed(_) | RunStatus::Terminated | RunStatus::DeleteError
        )
    }

    pub fn queue_rank(&self) -> Option<u32> {
        match self {
            RunStatus::Queued(rank) => Some(*rank),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::SetUp => write!(f, "set up"),
            RunStatus::Queued(rank) => write!(f, "queue {}", rank),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "Completed"),
            RunStatus::Failed(code) => write!(f, "Completed with error {}", code),
            RunStatus::Terminated => write!(f, "Completed (terminated)"),
            RunStatus::DeleteError => write!(f, "run delete error"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "set up" => RunStatus::SetUp,
            "running" => RunStatus::Running,
            "Completed" => RunStatus::Completed,
            "Completed (terminated)" => RunStatus::Terminated,
            "run delete error" => RunStatus::DeleteError,
            other => {
                if let Some(rank) = other.strip_prefix("queue ") {
                    RunStatus::Queued(rank.parse()?)
                } else if let Some(code) = other.strip_prefix("Completed with error ") {
                    RunStatus::Failed(code.parse()?)
                } else {
                    return Err(anyhow!("Unknown run status: {}", other));
                }
            }
        })
    }
}

/// Where an installed program came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramSource {
    /// Uploaded archive, by its original file name
    Archive(String),
    Git { url: String, reference: String },
}

impl ProgramSource {
    pub fn is_git(&self) -> bool {
        matches!(self, ProgramSource::Git { .. })
    }
}

/// One installed (or installing) program
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramRecord {
    pub name: String,
    pub upload_date: String,
    pub python_version: String,
    pub status: ProgramStatus,
    /// Install worker, set only while installing
    pub pid: Option<u32>,
    /// Canonical archive under the programs area
    pub zip_fname: String,
    pub libraries: Vec<String>,
    pub default_args: String,
    pub test_command: Option<String>,
    pub source: ProgramSource,
    /// Declared inputs; `None` when the default file does not exist
    pub inputs: BTreeMap<String, Option<String>>,
    pub outputs: BTreeMap<String, String>,
    pub version: String,
}

impl Record for ProgramRecord {
    const TABLE: &'static str = "program_details";
    const COLUMNS: &'static [&'static str] = &[
        "program_name",
        "upload_date",
        "python_version",
        "status",
        "PID",
        "zip_fname",
        "selected_libs",
        "def_args",
        "test_command",
        "source",
        "inputs",
        "outputs",
        "version",
    ];

    fn to_row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.upload_date.clone(),
            self.python_version.clone(),
            self.status.to_string(),
            pid_cell(self.pid),
            self.zip_fname.clone(),
            self.libraries.join(" "),
            self.default_args.clone(),
            self.test_command.clone().unwrap_or_default(),
            json_cell(&self.source),
            json_cell(&self.inputs),
            json_cell(&self.outputs),
            self.version.clone(),
        ]
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        let source = row.get("source");
        Ok(Self {
            name: row.get("program_name").to_string(),
            upload_date: row.get("upload_date").to_string(),
            python_version: row.get("python_version").to_string(),
            status: row.get("status").parse()?,
            pid: parse_pid(row)?,
            zip_fname: row.get("zip_fname").to_string(),
            libraries: row
                .get("selected_libs")
                .split_whitespace()
                .map(String::from)
                .collect(),
            default_args: row.get("def_args").to_string(),
            test_command: row.optional("test_command"),
            source: serde_json::from_str(source)
                .with_context(|| format!("Invalid source descriptor {}", source))?,
            inputs: row.json("inputs")?,
            outputs: row.json("outputs")?,
            version: row.get("version").to_string(),
        })
    }
}

/// One run of a program under a purpose label
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub program: String,
    pub purpose: String,
    pub args: String,
    pub setup_date: String,
    pub status: RunStatus,
    /// Run worker, cleared once the run is terminal
    pub pid: Option<u32>,
    /// Inputs uploaded for this run, name -> path inside the run workspace
    pub uploaded: BTreeMap<String, String>,
    /// Inputs inherited from the program defaults
    pub inherited: BTreeMap<String, String>,
    /// Inputs taken from the registered file table, name -> file name
    pub registered: BTreeMap<String, String>,
    pub undefined: Vec<String>,
    pub outputs: BTreeMap<String, String>,
    pub comment: String,
    pub notifications: Vec<String>,
}

impl RunRecord {
    pub fn new(program: &str, purpose: &str) -> Self {
        Self {
            program: program.to_string(),
            purpose: purpose.to_string(),
            args: String::new(),
            setup_date: String::new(),
            status: RunStatus::SetUp,
            pid: None,
            uploaded: BTreeMap::new(),
            inherited: BTreeMap::new(),
            registered: BTreeMap::new(),
            undefined: Vec::new(),
            outputs: BTreeMap::new(),
            comment: String::new(),
            notifications: Vec::new(),
        }
    }

    pub fn id(&self) -> String {
        run_id(&self.program, &self.purpose)
    }

    pub fn is(&self, program: &str, purpose: &str) -> bool {
        self.program == program && self.purpose == purpose
    }
}

impl Record for RunRecord {
    const TABLE: &'static str = "run_details";
    const COLUMNS: &'static [&'static str] = &[
        "program_name",
        "purpose",
        "python_args",
        "setup_date",
        "status",
        "PID",
        "uploaded_files",
        "inherited_files",
        "registered_files",
        "undefineds",
        "outputs",
        "comment",
        "notifications",
    ];

    fn to_row(&self) -> Vec<String> {
        vec![
            self.program.clone(),
            self.purpose.clone(),
            self.args.clone(),
            self.setup_date.clone(),
            self.status.to_string(),
            pid_cell(self.pid),
            json_cell(&self.uploaded),
            json_cell(&self.inherited),
            json_cell(&self.registered),
            json_cell(&self.undefined),
            json_cell(&self.outputs),
            self.comment.clone(),
            json_cell(&self.notifications),
        ]
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            program: row.get("program_name").to_string(),
            purpose: row.get("purpose").to_string(),
            args: row.get("python_args").to_string(),
            setup_date: row.get("setup_date").to_string(),
            status: row.get("status").parse()?,
            pid: parse_pid(row)?,
            uploaded: row.json("uploaded_files")?,
            inherited: row.json("inherited_files")?,
            registered: row.json("registered_files")?,
            undefined: row.json("undefineds")?,
            outputs: row.json("outputs")?,
            comment: row.get("comment").to_string(),
            notifications: row.json("notifications")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryStatus {
    Installed,
    /// Delete requested while still in use
    Deleted,
}

impl fmt::Display for LibraryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryStatus::Installed => write!(f, "Installed"),
            LibraryStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for LibraryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Installed" => Ok(LibraryStatus::Installed),
            "deleted" => Ok(LibraryStatus::Deleted),
            other => Err(anyhow!("Unknown library status: {}", other)),
        }
    }
}

/// Shared library package that programs link into their environment
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryRecord {
    pub name: String,
    /// Importable entry inside the extracted package
    pub path_to_exec: String,
    pub upload_date: String,
    pub zip_path: String,
    pub orig_filename: String,
    pub status: LibraryStatus,
    pub size: String,
    pub comment: String,
    /// Programs depending on this library
    pub used_by: Vec<String>,
}

impl Record for LibraryRecord {
    const TABLE: &'static str = "lib_details";
    const COLUMNS: &'static [&'static str] = &[
        "library_name",
        "path_to_exec",
        "upload_date",
        "zip_path",
        "orig_filename",
        "status",
        "size",
        "comment",
        "used_in",
    ];

    fn to_row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.path_to_exec.clone(),
            self.upload_date.clone(),
            self.zip_path.clone(),
            self.orig_filename.clone(),
            self.status.to_string(),
            self.size.clone(),
            self.comment.clone(),
            json_cell(&self.used_by),
        ]
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            name: row.get("library_name").to_string(),
            path_to_exec: row.get("path_to_exec").to_string(),
            upload_date: row.get("upload_date").to_string(),
            zip_path: row.get("zip_path").to_string(),
            orig_filename: row.get("orig_filename").to_string(),
            status: row.get("status").parse()?,
            size: row.get("size").to_string(),
            comment: row.get("comment").to_string(),
            used_by: row.json("used_in")?,
        })
    }
}

/// File registered for reuse across runs
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub filename: String,
    pub upload_date: String,
    pub size: String,
    /// SHA-256 of uploaded content; `None` for files registered by path
    pub hash: Option<String>,
    pub comment: String,
    /// Run identifiers referencing this file
    pub used_by: Vec<String>,
    /// Directory of a path-registered file; `None` means the files area
    pub dir: Option<String>,
}

impl FileRecord {
    /// Location on disk, given the canonical files area
    pub fn path(&self, files_dir: &Path) -> PathBuf {
        match &self.dir {
            Some(dir) => Path::new(dir).join(&self.filename),
            None => files_dir.join(&self.filename),
        }
    }
}

impl Record for FileRecord {
    const TABLE: &'static str = "file_data";
    const COLUMNS: &'static [&'static str] = &[
        "filename",
        "upload_date",
        "size",
        "hash",
        "comment",
        "used_in",
        "dir",
    ];

    fn to_row(&self) -> Vec<String> {
        vec![
            self.filename.clone(),
            self.upload_date.clone(),
            self.size.clone(),
            self.hash.clone().unwrap_or_default(),
            self.comment.clone(),
            json_cell(&self.used_by),
            self.dir.clone().unwrap_or_default(),
        ]
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            filename: row.get("filename").to_string(),
            upload_date: row.get("upload_date").to_string(),
            size: row.get("size").to_string(),
            hash: row.optional("hash"),
            comment: row.get("comment").to_string(),
            used_by: row.json("used_in")?,
            dir: row.optional("dir"),
        })
    }
}
