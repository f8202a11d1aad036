//! Run orchestrator
//!
//! A run is a private copy of an installed program under
//! `runs/<program>/<purpose>/` with its own inputs. `request_run` builds the
//! workspace and starts a `worker run` process; `perform_run` waits for
//! admission, executes `python <args>` in the program's environment and
//! archives the workspace on success.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::admission::renumber_queue;
use crate::archive::{extract_archive, zip_dir, ArchiveKind};
use crate::error::{Failure, HostError};
use crate::host::{Host, Submission};
use crate::install::INSTALL_LOG;
use crate::manifest::{Manifest, MASTER_INPUT_MANIFEST, PROGRAM_MANIFEST};
use crate::notify::{extract_emails, notify, Message};
use crate::process::is_alive;
use crate::runner::run_checked;
use crate::store::records::{run_id, ProgramRecord, ProgramStatus, RunRecord, RunStatus};
use crate::util::{copy_tree, is_safe_name, one_line, relative_to, remove_tree, sanitize_args, sanitize_name, timestamp};

/// Combined output of the run worker, inside the run workspace
pub const RUN_LOG: &str = "run_output_and_error.log";
const INPUTS_DIR: &str = "inputs";
const MASTER_INPUT_DIR: &str = "masterinput";

pub const DELETE_OK: i32 = 0;
pub const DELETE_ALREADY_REMOVED: i32 = 1;
pub const DELETE_FAILED: i32 = 2;

/// What to feed a single declared input
#[derive(Debug, Clone, PartialEq)]
pub enum InputSelection {
    /// Use the file shipped with the program
    Inherit,
    Upload { file_name: String, data: Vec<u8> },
    /// A file from the registered-file table, by name
    Registered(String),
    Undefined,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunInputs {
    PerInput(BTreeMap<String, InputSelection>),
    /// zip/tar archive with `MasterInput.cfg` at its root
    Master { file_name: String, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub program: String,
    pub purpose: String,
    pub inputs: RunInputs,
    /// Arguments after `python`; the program default when blank
    pub args: String,
    /// Free text; every address found in it is notified
    pub notifications: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub code: i32,
    pub output: String,
}

/// Where each input of a run comes from, paths relative to the workspace
/// except registered files
#[derive(Debug, Default)]
struct ResolvedInputs {
    uploaded: BTreeMap<String, String>,
    inherited: BTreeMap<String, String>,
    registered: BTreeMap<String, String>,
    undefined: Vec<String>,
}

fn rejected(message: impl Into<String>) -> anyhow::Error {
    HostError::Rejected(message.into()).into()
}

impl Host {
    /// Set up the run workspace and start the run worker.
    pub async fn request_run(&self, request: RunRequest) -> Result<Submission> {
        let purpose = sanitize_name(&request.purpose);
        if !is_safe_name(&purpose) {
            return Ok(Submission::rejected(format!("Invalid purpose: {:?}", request.purpose)));
        }
        let program = match self.tables.programs.find(|r| r.name == request.program)? {
            Some(program) if program.status == ProgramStatus::Installed => program,
            Some(program) => {
                return Ok(Submission::rejected(format!(
                    "Program {} is not ready ({})",
                    program.name, program.status
                )))
            }
            None => return Ok(Submission::rejected(format!("Program {} not found", request.program))),
        };
        let notifications = extract_emails(&self.config.email_pattern, &request.notifications)?;

        let workspace = self.config.run_dir(&program.name, &purpose);
        let claimed = self.tables.runs.update(|rows| {
            if rows.iter().any(|r| r.is(&program.name, &purpose)) {
                return Ok(false);
            }
            if let Some(parent) = workspace.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            match fs::create_dir(&workspace) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e).with_context(|| format!("Failed to create {}", workspace.display())),
            }
        })?;
        if !claimed {
            return Ok(Submission::rejected(format!(
                "A run of {} with purpose {} already exists",
                program.name, purpose
            )));
        }

        let id = run_id(&program.name, &purpose);
        let started = self
            .prepare_run(&program, &purpose, &workspace, request, notifications)
            .and_then(|record| {
                let pid = self.start_run_worker(&record, &workspace)?;
                Ok((record, pid))
            });

        match started {
            Ok((record, pid)) => {
                let body = format!(
                    "A run of program {} with purpose {} is successfully triggered. \
                     Emails regardless of the outcome will be sent. Visit {} for the run page for further details.",
                    record.program,
                    record.purpose,
                    self.config.run_link(&id)
                );
                notify(
                    self.notifier.as_ref(),
                    Message {
                        subject: format!("{} run trigger", self.config.service_name),
                        body,
                        to: record.notifications.clone(),
                    },
                )
                .await;
                Ok(Submission::Started { pid })
            }
            Err(e) => {
                self.discard_run(&program.name, &purpose, &workspace);
                match e.downcast::<HostError>() {
                    Ok(HostError::Rejected(message)) => Ok(Submission::Rejected(message)),
                    Ok(other) => Err(other.into()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn prepare_run(
        &self,
        program: &ProgramRecord,
        purpose: &str,
        workspace: &Path,
        request: RunRequest,
        notifications: Vec<String>,
    ) -> Result<RunRecord> {
        let id = run_id(&program.name, purpose);
        copy_tree(&self.config.program_dir(&program.name), workspace, &[INSTALL_LOG])?;

        let inputs = match request.inputs {
            RunInputs::PerInput(selection) => self.resolve_inputs(program, &id, workspace, selection)?,
            RunInputs::Master { file_name, data } => resolve_master_input(program, workspace, &file_name, &data)?,
        };
        let outputs = rewrite_run_manifest(workspace, &inputs)?;

        let args = if request.args.trim().is_empty() {
            program.default_args.clone()
        } else {
            request.args
        };
        let record = RunRecord {
            args: sanitize_args(&args),
            setup_date: timestamp(),
            status: RunStatus::SetUp,
            uploaded: inputs.uploaded,
            inherited: inputs.inherited,
            registered: inputs.registered,
            undefined: inputs.undefined,
            outputs,
            comment: one_line(&request.comment),
            notifications,
            ..RunRecord::new(&program.name, purpose)
        };

        self.tables.runs.update(|rows| {
            rows.push(record.clone());
            Ok(())
        })?;
        Ok(record)
    }

    fn resolve_inputs(
        &self,
        program: &ProgramRecord,
        id: &str,
        workspace: &Path,
        selection: BTreeMap<String, InputSelection>,
    ) -> Result<ResolvedInputs> {
        let mut selection: BTreeMap<String, InputSelection> =
            selection.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect();
        if let Some(unknown) = selection.keys().find(|k| !program.inputs.contains_key(*k)) {
            return Err(rejected(format!("Program {} has no input {}", program.name, unknown)));
        }

        let mut resolved = ResolvedInputs::default();
        for (name, default) in &program.inputs {
            match selection.remove(name).unwrap_or(InputSelection::Undefined) {
                InputSelection::Inherit => match default {
                    Some(path) => {
                        resolved.inherited.insert(name.clone(), path.clone());
                    }
                    None => return Err(rejected(format!("Input {} has no default to inherit", name))),
                },
                InputSelection::Upload { file_name, data } => {
                    let file_name = sanitize_name(&file_name);
                    if !is_safe_name(&file_name) {
                        return Err(rejected(format!("Invalid file name for input {}", name)));
                    }
                    let dir = workspace.join(INPUTS_DIR);
                    fs::create_dir_all(&dir)?;
                    fs::write(dir.join(&file_name), data)
                        .with_context(|| format!("Failed to save input {}", name))?;
                    resolved
                        .uploaded
                        .insert(name.clone(), format!("{}/{}", INPUTS_DIR, file_name));
                }
                InputSelection::Registered(file_name) => match self.add_file_user(&file_name, id)? {
                    Some(path) => {
                        resolved.registered.insert(name.clone(), path.display().to_string());
                    }
                    None => return Err(rejected(format!("Registered file {} not found", file_name))),
                },
                InputSelection::Undefined => resolved.undefined.push(name.clone()),
            }
        }
        Ok(resolved)
    }

    fn start_run_worker(&self, record: &RunRecord, workspace: &Path) -> Result<u32> {
        let cmd = self.worker_command(&["run", &record.program, &record.purpose])?;
        let handle = self.launcher.launch(&cmd, &workspace.join(RUN_LOG))?;

        self.tables.runs.update(|rows| {
            if let Some(row) = rows
                .iter_mut()
                .find(|r| r.is(&record.program, &record.purpose) && !r.status.is_terminal())
            {
                row.pid = Some(handle.pid);
            }
            Ok(())
        })?;
        info!("Run {} started (pid {})", record.id(), handle.pid);
        Ok(handle.pid)
    }

    /// Undo a half-built run
    fn discard_run(&self, program: &str, purpose: &str, workspace: &Path) {
        let id = run_id(program, purpose);
        if let Err(e) = self.release_run_files(&id) {
            warn!("Failed to release files of {}: {:#}", id, e);
        }
        let result = self.tables.runs.update(|rows| {
            rows.retain(|r| !r.is(program, purpose));
            Ok(())
        });
        if let Err(e) = result {
            warn!("Failed to drop record of {}: {:#}", id, e);
        }
        if let Err(e) = remove_tree(workspace) {
            warn!("Failed to remove {}: {:#}", workspace.display(), e);
        }
        remove_if_empty(workspace.parent());
    }

    /// Worker side of a run. Returns the process exit code.
    pub async fn perform_run(&self, program: &str, purpose: &str) -> Result<i32> {
        let pid = std::process::id();
        self.update_run(program, purpose, |r| r.pid = Some(pid))?;

        let outcome = tokio::select! {
            result = self.run_stages(program, purpose) => result,
            _ = self.interrupted() => Err(HostError::Interrupted.into()),
        };

        let (status, code, summary) = match outcome {
            Ok(()) => (RunStatus::Completed, 0, "is successfully completed."),
            Err(e) => {
                error!("Run {}/{} failed: {:?}", program, purpose, e);
                let failure = Failure::classify(&e);
                let summary = match failure {
                    Failure::Command => "had an error upon calling the program.",
                    Failure::Interrupted => "was interrupted.",
                    _ => "had an error upon trying to call the program.",
                };
                let code = failure.run_code();
                (RunStatus::Failed(code), code as i32, summary)
            }
        };

        let record = self.tables.runs.update(|rows| {
            let row = rows
                .iter_mut()
                .find(|r| r.is(program, purpose))
                .with_context(|| format!("Run {}/{} has no record", program, purpose))?;
            // a stop request may already have recorded the termination
            if row.status != RunStatus::Terminated {
                row.status = status.clone();
            }
            row.pid = None;
            let record = row.clone();
            renumber_queue(rows);
            Ok(record)
        })?;
        info!("Run {}/{}: {}", program, purpose, record.status);
        let summary = if record.status == RunStatus::Terminated {
            "was terminated."
        } else {
            summary
        };

        let body = format!(
            "The program {} with purpose {} {} See more details on {}",
            program,
            purpose,
            summary,
            self.config.run_link(&record.id())
        );
        notify(
            self.notifier.as_ref(),
            Message {
                subject: format!("{} run {}", self.config.service_name, record.status),
                body,
                to: record.notifications,
            },
        )
        .await;
        Ok(code)
    }

    async fn run_stages(&self, program: &str, purpose: &str) -> Result<()> {
        self.await_admission(program, purpose).await?;

        let record = self
            .tables
            .runs
            .find(|r| r.is(program, purpose))?
            .with_context(|| format!("Run {}/{} has no record", program, purpose))?;
        let workspace = self.config.run_dir(program, purpose);

        let cmd = self
            .shell(format!("{} && python {}", self.config.activate_env(program), record.args))
            .with_work_dir(&workspace)
            .with_env(["PYTHONUNBUFFERED=1"]);
        run_checked(self.runner.as_ref(), &cmd).await?;

        archive_run(&workspace, &record.id()).await
    }

    /// Remove a finished run, its workspace and its file references.
    pub fn request_delete(&self, program: &str, purpose: &str) -> Result<DeleteReport> {
        let id = run_id(program, purpose);
        let workspace = self.config.run_dir(program, purpose);

        if let Some(record) = self.tables.runs.find(|r| r.is(program, purpose))? {
            if let Some(pid) = record.pid.filter(|p| !record.status.is_terminal() && is_alive(*p)) {
                return Ok(DeleteReport {
                    code: DELETE_FAILED,
                    output: format!("Run {} is still active (pid {}); stop it first", id, pid),
                });
            }
        }

        self.release_run_files(&id)?;
        let removed = self.tables.runs.update(|rows| {
            let removed = rows
                .iter()
                .position(|r| r.is(program, purpose))
                .map(|i| rows.remove(i));
            renumber_queue(rows);
            Ok(removed)
        })?;

        if !workspace.exists() {
            return Ok(DeleteReport {
                code: DELETE_ALREADY_REMOVED,
                output: format!("Run folder of {} is already removed", id),
            });
        }

        match remove_tree(&workspace) {
            Ok(()) => {
                remove_if_empty(workspace.parent());
                info!("Run {} deleted", id);
                Ok(DeleteReport {
                    code: DELETE_OK,
                    output: format!("Run {} deleted", id),
                })
            }
            Err(e) => {
                let fault = format!("Error deleting run {}: {:?}", id, e);
                error!("{}", fault);
                if let Some(mut record) = removed {
                    record.status = RunStatus::DeleteError;
                    record.pid = None;
                    self.tables.runs.update(|rows| {
                        rows.retain(|r| !r.is(program, purpose));
                        rows.push(record);
                        Ok(())
                    })?;
                }
                Ok(DeleteReport {
                    code: DELETE_FAILED,
                    output: fault,
                })
            }
        }
    }

    /// `MasterInput.cfg` skeleton listing the file name of every input
    pub fn input_template(&self, program: &str) -> Result<String> {
        let path = self.config.program_dir(program).join(PROGRAM_MANIFEST);
        let mut template = Manifest::default();
        if path.exists() {
            let manifest = Manifest::load(&path)?;
            for (name, value) in manifest.items("inputs")? {
                let file_name = Path::new(&value)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                template.set("inputs", &name, &file_name);
            }
        }
        if !template.has_section("inputs") {
            template = Manifest::parse("[inputs]\n")?;
        }
        Ok(template.to_string())
    }

    pub(crate) fn update_run(
        &self,
        program: &str,
        purpose: &str,
        mutate: impl FnOnce(&mut RunRecord),
    ) -> Result<RunRecord> {
        self.tables.runs.update(|rows| {
            let row = rows
                .iter_mut()
                .find(|r| r.is(program, purpose))
                .with_context(|| format!("Run {}/{} has no record", program, purpose))?;
            mutate(row);
            Ok(row.clone())
        })
    }
}

/// Zip the run workspace to `<workspace>/<run id>.zip`
pub(crate) async fn archive_run(workspace: &Path, id: &str) -> Result<()> {
    let src = workspace.to_path_buf();
    let dest = workspace.join(format!("{}.zip", id));
    tokio::task::spawn_blocking(move || zip_dir(&src, &dest))
        .await
        .context("Archive task failed")?
}

fn remove_if_empty(dir: Option<&Path>) {
    if let Some(dir) = dir {
        let empty = fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false);
        if empty {
            let _ = fs::remove_dir(dir);
        }
    }
}

fn resolve_master_input(
    program: &ProgramRecord,
    workspace: &Path,
    file_name: &str,
    data: &[u8],
) -> Result<ResolvedInputs> {
    let file_name = sanitize_name(file_name);
    if ArchiveKind::from_name(&file_name).is_none() {
        return Err(rejected("Uploaded master input is not a zip or tar file."));
    }

    let scratch = TempDir::new_in(workspace).context("Failed to create scratch directory")?;
    let archive = scratch.path().join(&file_name);
    fs::write(&archive, data).context("Failed to save master input")?;
    let dest = workspace.join(MASTER_INPUT_DIR);
    if let Err(e) = extract_archive(&archive, &dest) {
        warn!("Bad master input for {}: {:#}", program.name, e);
        return Err(rejected("Uploaded master input cannot be extracted."));
    }
    drop(scratch);

    let manifest_path = dest.join(MASTER_INPUT_MANIFEST);
    if !manifest_path.is_file() {
        return Err(rejected(format!("Uploaded master input has no {} in the root.", MASTER_INPUT_MANIFEST)));
    }
    let manifest = Manifest::load(&manifest_path).map_err(|e| rejected(format!("{:#}", e)))?;
    if !manifest.has_section("inputs") {
        return Err(rejected(format!("No inputs section in {}", MASTER_INPUT_MANIFEST)));
    }
    let listed: BTreeMap<String, String> = manifest.items("inputs")?.into_iter().collect();

    let mut resolved = ResolvedInputs::default();
    for (name, default) in &program.inputs {
        let provided = listed
            .get(name)
            .filter(|value| !value.is_empty() && dest.join(value).is_file());
        match (provided, default) {
            (Some(value), _) => {
                let rel = relative_to(&dest.join(value), workspace);
                resolved.uploaded.insert(name.clone(), rel.display().to_string());
            }
            (None, Some(path)) => {
                resolved.inherited.insert(name.clone(), path.clone());
            }
            (None, None) => resolved.undefined.push(name.clone()),
        }
    }
    Ok(resolved)
}

/// Point the run's manifest at the run workspace and its inputs. Returns the
/// outputs relative to the workspace.
fn rewrite_run_manifest(workspace: &Path, inputs: &ResolvedInputs) -> Result<BTreeMap<String, String>> {
    let path = workspace.join(PROGRAM_MANIFEST);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let mut manifest = Manifest::load(&path)?;
    if manifest.has_section("Root") && manifest.get_raw("Root", "RootDir").is_some() {
        manifest.set("Root", "RootDir", &workspace.display().to_string());
        manifest.clear_defaults();
    }
    for (name, rel) in inputs.uploaded.iter().chain(&inputs.inherited) {
        manifest.set("inputs", name, &workspace.join(rel).display().to_string());
    }
    for (name, abs) in &inputs.registered {
        manifest.set("inputs", name, abs);
    }
    for name in &inputs.undefined {
        manifest.set("inputs", name, "");
    }

    let outputs = manifest
        .items("outputs")?
        .into_iter()
        .map(|(name, value)| {
            let rel = relative_to(&workspace.join(value), workspace);
            (name, rel.display().to_string())
        })
        .collect();
    manifest.save(&path)?;
    Ok(outputs)
}
