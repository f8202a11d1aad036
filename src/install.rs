//! Installation orchestrator
//!
//! `request_install` claims the program name and starts a detached
//! `worker install` process; `perform_install` is that worker. It walks the
//! stages below, writing each one to the program record, and always ends in
//! `Installed` or `Installed with error (<code>)`:
//!
//! ```text
//! installing -> getting the files -> creating conda env -> installing packages
//!            -> (running self-test) -> (creating the zip from repo) -> Installed
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tempfile::TempDir;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::archive::{extract_archive, zip_dir, ArchiveKind};
use crate::error::{Failure, HostError};
use crate::host::{Host, Submission};
use crate::manifest::{Manifest, PROGRAM_MANIFEST};
use crate::process::is_alive;
use crate::runner::{run_checked, CommandSpec};
use crate::store::records::{LibraryStatus, ProgramRecord, ProgramSource, ProgramStatus};
use crate::util::{
    copy_tree, file_stamp, is_safe_name, is_within, relative_to, remove_tree, sanitize_name,
    split_extension, timestamp,
};

/// Combined output of the install worker, inside the program workspace
pub const INSTALL_LOG: &str = "install_output_and_error.log";

pub const UNINSTALL_OK: i32 = 0;
pub const UNINSTALL_ALREADY_REMOVED: i32 = 1;
pub const UNINSTALL_FAILED: i32 = 2;

const NO_VERSION: &str = "No valid modules with version info found in the root.";

/// Where the program comes from
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRequest {
    /// Uploaded zip/tar archive
    Archive(PathBuf),
    Git {
        url: String,
        reference: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallRequest {
    pub name: String,
    pub source: SourceRequest,
    pub python_version: String,
    pub libraries: Vec<String>,
    pub default_args: String,
    pub test_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallReport {
    pub code: i32,
    pub output: String,
}

/// Inputs and outputs declared by a program manifest
#[derive(Debug, Default, PartialEq)]
struct DeclaredFiles {
    inputs: BTreeMap<String, Option<String>>,
    outputs: BTreeMap<String, String>,
    /// outputs that resolve outside the workspace, as `name = value`
    escaping: Vec<String>,
}

impl Host {
    /// Validate the request, claim the name and start the install worker.
    pub fn request_install(&self, request: InstallRequest) -> Result<Submission> {
        let name = sanitize_name(&request.name);
        if !is_safe_name(&name) {
            return Ok(Submission::rejected(format!(
                "Invalid program name: {:?}",
                request.name
            )));
        }

        let python_version = request.python_version.trim().to_string();
        if python_version.is_empty()
            || !python_version.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Ok(Submission::rejected(format!(
                "Invalid python version: {:?}",
                request.python_version
            )));
        }

        let stamp = file_stamp();
        let (source, zip_fname, upload) = match &request.source {
            SourceRequest::Archive(path) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if ArchiveKind::from_name(&file_name).is_none() {
                    return Ok(Submission::rejected(format!(
                        "Unsupported archive type: {}. Use .zip, .tar, .tar.gz or .tgz",
                        file_name
                    )));
                }
                if !path.is_file() {
                    return Ok(Submission::rejected(format!(
                        "Archive not found: {}",
                        path.display()
                    )));
                }
                let (stem, ext) = split_extension(&file_name);
                let stored = format!("{}_{}{}", sanitize_name(stem), stamp, ext);
                (ProgramSource::Archive(file_name), stored, Some(path.clone()))
            }
            SourceRequest::Git { url, reference } => {
                let url = url.trim();
                if url.is_empty() {
                    return Ok(Submission::rejected("Git source needs a repository URL"));
                }
                let reference = reference.as_deref().map(str::trim).unwrap_or_default();
                if reference.is_empty() {
                    return Ok(Submission::rejected(
                        "Git source needs a branch, tag or commit to check out",
                    ));
                }
                let source = ProgramSource::Git {
                    url: url.to_string(),
                    reference: reference.to_string(),
                };
                (source, format!("{}_{}.zip", name, stamp), None)
            }
        };

        let mut libraries: Vec<String> = Vec::new();
        for lib in request.libraries.iter().map(|l| sanitize_name(l)) {
            if is_safe_name(&lib) && !libraries.contains(&lib) {
                libraries.push(lib);
            }
        }

        let record = ProgramRecord {
            name: name.clone(),
            upload_date: timestamp(),
            python_version,
            status: ProgramStatus::Installing,
            pid: None,
            zip_fname,
            libraries,
            default_args: request.default_args.trim().to_string(),
            test_command: request
                .test_command
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            source,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            version: String::new(),
        };

        let workspace = self.config.program_dir(&name);
        let claimed = self.tables.programs.update(|rows| {
            if rows.iter().any(|r| r.name == name) {
                return Ok(false);
            }
            match fs::create_dir(&workspace) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create {}", workspace.display()))
                }
            }
            rows.push(record.clone());
            Ok(true)
        })?;
        if !claimed {
            return Ok(Submission::rejected(format!(
                "Program name {} is already in use",
                name
            )));
        }

        match self.start_install_worker(&record, upload.as_deref()) {
            Ok(pid) => Ok(Submission::Started { pid }),
            Err(e) => {
                self.rollback_install(&record);
                Err(e)
            }
        }
    }

    fn start_install_worker(&self, record: &ProgramRecord, upload: Option<&Path>) -> Result<u32> {
        if let Some(upload) = upload {
            let stored = self.config.programs_dir().join(&record.zip_fname);
            fs::copy(upload, &stored)
                .with_context(|| format!("Failed to store {}", upload.display()))?;
        }

        let cmd = self.worker_command(&["install", &record.name])?;
        let log = self.config.program_dir(&record.name).join(INSTALL_LOG);
        let handle = self.launcher.launch(&cmd, &log)?;

        self.tables.programs.update(|rows| {
            if let Some(row) = rows
                .iter_mut()
                .find(|r| r.name == record.name && !r.status.is_terminal())
            {
                row.pid = Some(handle.pid);
            }
            Ok(())
        })?;

        info!("Installation of {} started (pid {})", record.name, handle.pid);
        Ok(handle.pid)
    }

    fn rollback_install(&self, record: &ProgramRecord) {
        let result = self.tables.programs.update(|rows| {
            rows.retain(|r| r.name != record.name);
            Ok(())
        });
        if let Err(e) = result {
            warn!("Failed to drop record of {}: {:#}", record.name, e);
        }

        let workspace = self.config.program_dir(&record.name);
        if let Err(e) = remove_tree(&workspace) {
            warn!("Failed to remove {}: {:#}", workspace.display(), e);
        }
        let stored = self.config.programs_dir().join(&record.zip_fname);
        if stored.exists() {
            let _ = fs::remove_file(stored);
        }
    }

    /// Worker side of an installation. Returns the process exit code.
    pub async fn perform_install(&self, name: &str) -> Result<i32> {
        let pid = std::process::id();
        let record = self.update_program(name, |r| r.pid = Some(pid))?;
        info!("Installing {} (python {}) as pid {}", name, record.python_version, pid);

        let outcome = tokio::select! {
            result = self.install_stages(&record) => result,
            _ = self.interrupted() => Err(HostError::Interrupted.into()),
        };

        match outcome {
            Ok(()) => {
                self.update_program(name, |r| {
                    r.status = ProgramStatus::Installed;
                    r.pid = None;
                })?;
                info!("Program {} installed", name);
                Ok(0)
            }
            Err(e) => {
                let code = Failure::classify(&e).install_code();
                error!("Installation of {} failed: {:?}", name, e);
                self.update_program(name, |r| {
                    r.status = ProgramStatus::Failed(code);
                    r.pid = None;
                })?;
                Ok(code as i32)
            }
        }
    }

    async fn install_stages(&self, record: &ProgramRecord) -> Result<()> {
        let name = record.name.as_str();
        let workspace = self.config.program_dir(name);

        self.set_program_status(name, ProgramStatus::GettingFiles)?;
        self.fetch_source(record, &workspace)
            .await
            .context("Failed to get the program files")?;

        let version = probe_versions(&workspace);
        let declared = read_declared_files(&workspace)?;
        self.update_program(name, |r| {
            r.version = version;
            r.inputs = declared.inputs.clone();
            r.outputs = declared.outputs.clone();
        })?;
        if !declared.escaping.is_empty() {
            return Err(HostError::Validation(format!(
                "Outputs must stay inside the program folder: {}",
                declared.escaping.join(", ")
            ))
            .into());
        }

        self.set_program_status(name, ProgramStatus::CreatingEnv)?;
        let create = self
            .shell(format!(
                "{} create -y -n {} python={} conda-build",
                self.config.conda, name, record.python_version
            ))
            .with_work_dir(&workspace);
        run_checked(self.runner.as_ref(), &create).await?;

        self.set_program_status(name, ProgramStatus::InstallingPackages)?;
        let activate = self.config.activate_env(name);
        let packages = if workspace.join("setup.py").exists() {
            Some("pip install .")
        } else if workspace.join("requirements.txt").exists() {
            Some("pip install -r requirements.txt")
        } else {
            None
        };
        if let Some(packages) = packages {
            let cmd = self
                .shell(format!("{} && {}", activate, packages))
                .with_work_dir(&workspace);
            run_checked(self.runner.as_ref(), &cmd).await?;
        }
        self.link_libraries(record, &workspace).await?;

        if let Some(test) = &record.test_command {
            self.set_program_status(name, ProgramStatus::RunningSelfTest)?;
            let cmd = self
                .shell(format!("{} && {}", activate, test))
                .with_work_dir(&workspace);
            run_checked(self.runner.as_ref(), &cmd).await?;
        }

        if record.source.is_git() {
            self.set_program_status(name, ProgramStatus::Archiving)?;
            let dest = self.config.programs_dir().join(&record.zip_fname);
            let src = workspace.clone();
            tokio::task::spawn_blocking(move || zip_dir(&src, &dest))
                .await
                .context("Archive task failed")??;
        }

        Ok(())
    }

    async fn fetch_source(&self, record: &ProgramRecord, workspace: &Path) -> Result<()> {
        match &record.source {
            ProgramSource::Archive(_) => {
                let archive = self.config.programs_dir().join(&record.zip_fname);
                let dest = workspace.to_path_buf();
                tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
                    .await
                    .context("Extraction task failed")??;
            }
            ProgramSource::Git { url, reference } => {
                // removed on every exit path, including interruption
                let scratch = TempDir::new_in(self.config.programs_dir())
                    .context("Failed to create scratch directory")?;
                let checkout = scratch.path().join("repo");
                let checkout_str = checkout.display().to_string();

                let git = |args: &[&str]| CommandSpec::new("git").with_args(args.to_vec());
                run_checked(self.runner.as_ref(), &git(&["clone", url, &checkout_str])).await?;
                run_checked(
                    self.runner.as_ref(),
                    &git(&["-C", &checkout_str, "checkout", reference]),
                )
                .await?;
                run_checked(
                    self.runner.as_ref(),
                    &git(&["-C", &checkout_str, "submodule", "update", "--init", "--recursive"]),
                )
                .await?;

                let dest = workspace.to_path_buf();
                tokio::task::spawn_blocking(move || copy_tree(&checkout, &dest, &[]))
                    .await
                    .context("Copy task failed")??;
                drop(scratch);
            }
        }
        Ok(())
    }

    async fn link_libraries(&self, record: &ProgramRecord, workspace: &Path) -> Result<()> {
        if record.libraries.is_empty() {
            return Ok(());
        }

        let available = self.tables.libraries.load()?;
        let mut linked = Vec::new();
        let mut steps = Vec::new();
        for wanted in &record.libraries {
            match available
                .iter()
                .find(|l| &l.name == wanted && l.status == LibraryStatus::Installed)
            {
                Some(lib) => {
                    let path = self.config.libs_dir().join(&lib.name).join(&lib.path_to_exec);
                    steps.push(format!("{} develop \"{}\"", self.config.conda, path.display()));
                    linked.push(lib.name.clone());
                }
                None => warn!("Library {} is not available, not linking it", wanted),
            }
        }
        if linked.is_empty() {
            return Ok(());
        }

        let cmd = self
            .shell(format!(
                "{} && {}",
                self.config.activate_env(&record.name),
                steps.join(" && ")
            ))
            .with_work_dir(workspace);
        run_checked(self.runner.as_ref(), &cmd).await?;

        self.tables.libraries.update(|rows| {
            for row in rows.iter_mut().filter(|r| linked.contains(&r.name)) {
                if !row.used_by.contains(&record.name) {
                    row.used_by.push(record.name.clone());
                }
            }
            Ok(())
        })?;
        info!("Linked libraries {:?} into {}", linked, record.name);
        Ok(())
    }

    /// Remove a program, its environment and its library references.
    ///
    /// Never fails for state reasons; the outcome is in the report code.
    pub async fn request_uninstall(&self, name: &str) -> Result<UninstallReport> {
        let workspace = self.config.program_dir(name);

        if let Some(record) = self.tables.programs.find(|r| r.name == name)? {
            if let Some(pid) = record.pid.filter(|p| !record.status.is_terminal() && is_alive(*p)) {
                return Ok(UninstallReport {
                    code: UNINSTALL_FAILED,
                    output: format!("Installation of {} is still running (pid {})", name, pid),
                });
            }
        }

        let removed = self.tables.programs.update(|rows| {
            Ok(rows
                .iter()
                .position(|r| r.name == name)
                .map(|i| rows.remove(i)))
        })?;

        if removed.is_none() && !workspace.exists() {
            self.release_program_libraries(name)?;
            return Ok(UninstallReport {
                code: UNINSTALL_ALREADY_REMOVED,
                output: format!("Program {} is already removed", name),
            });
        }

        let mut output = Vec::new();
        match self.uninstall_steps(name, &workspace, &mut output).await {
            Ok(()) => {
                info!("Program {} uninstalled", name);
                let code = if removed.is_some() {
                    UNINSTALL_OK
                } else {
                    UNINSTALL_ALREADY_REMOVED
                };
                Ok(UninstallReport {
                    code,
                    output: output.join("\n"),
                })
            }
            Err(e) => {
                let fault = format!("Error uninstalling program {}: {:?}", name, e);
                error!("{}", fault);
                output.push(fault.clone());

                if let Some(mut record) = removed {
                    record.status = ProgramStatus::UninstallError;
                    record.pid = None;
                    self.tables.programs.update(|rows| {
                        rows.retain(|r| r.name != name);
                        rows.push(record);
                        Ok(())
                    })?;
                }
                if workspace.exists() {
                    append_log(&workspace.join(INSTALL_LOG), &fault);
                }

                Ok(UninstallReport {
                    code: UNINSTALL_FAILED,
                    output: output.join("\n"),
                })
            }
        }
    }

    async fn uninstall_steps(&self, name: &str, workspace: &Path, output: &mut Vec<String>) -> Result<()> {
        if self.env_exists(name).await {
            let cmd = self.shell(format!("{} env remove -y -n {}", self.config.conda, name));
            let out = run_checked(self.runner.as_ref(), &cmd).await?;
            output.push(out.output);
        } else {
            output.push(format!("No conda environment named {}", name));
        }

        if workspace.exists() {
            remove_tree(workspace)?;
            output.push(format!("Removed {}", workspace.display()));
        }

        self.release_program_libraries(name)?;
        Ok(())
    }

    /// Whether conda knows an environment called `name`; assumes yes when
    /// the listing cannot be read
    async fn env_exists(&self, name: &str) -> bool {
        let cmd = self.shell(format!("{} env list --json", self.config.conda));
        let listing = match self.runner.run(&cmd).await {
            Ok(out) if out.success() => out.output,
            _ => return true,
        };

        #[derive(serde::Deserialize)]
        struct EnvList {
            envs: Vec<PathBuf>,
        }
        match serde_json::from_str::<EnvList>(&listing) {
            Ok(list) => list.envs.iter().any(|env| env.file_name().is_some_and(|n| n == name)),
            Err(_) => true,
        }
    }

    fn release_program_libraries(&self, name: &str) -> Result<()> {
        self.tables.libraries.update(|rows| {
            for row in rows.iter_mut() {
                row.used_by.retain(|p| p != name);
            }
            Ok(())
        })
    }

    pub(crate) fn update_program(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut ProgramRecord),
    ) -> Result<ProgramRecord> {
        self.tables.programs.update(|rows| {
            let row = rows
                .iter_mut()
                .find(|r| r.name == name)
                .with_context(|| format!("Program {} has no record", name))?;
            mutate(row);
            Ok(row.clone())
        })
    }

    fn set_program_status(&self, name: &str, status: ProgramStatus) -> Result<()> {
        info!("{}: {}", name, status);
        self.update_program(name, |r| r.status = status)?;
        Ok(())
    }
}

fn append_log(path: &Path, text: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "\n[{}] {}", timestamp(), text));
    if let Err(e) = result {
        warn!("Failed to append to {}: {}", path.display(), e);
    }
}

/// Read `config/MasterConfig.cfg`, pointing `[Root] RootDir` at the workspace
fn read_declared_files(workspace: &Path) -> Result<DeclaredFiles> {
    let path = workspace.join(PROGRAM_MANIFEST);
    if !path.exists() {
        info!("No {} in {}", PROGRAM_MANIFEST, workspace.display());
        return Ok(DeclaredFiles::default());
    }

    let mut manifest = Manifest::load(&path)?;
    if manifest.get_raw("Root", "RootDir").is_some() {
        manifest.set("Root", "RootDir", &workspace.display().to_string());
        manifest.save(&path)?;
    }

    let mut declared = DeclaredFiles::default();
    for (name, value) in manifest.items("inputs")? {
        let file = workspace.join(&value);
        let resolved = (!value.is_empty() && file.exists())
            .then(|| relative_to(&file, workspace).display().to_string());
        declared.inputs.insert(name, resolved);
    }
    for (name, value) in manifest.items("outputs")? {
        if !is_within(Path::new(&value), workspace) {
            declared.escaping.push(format!("{} = {}", name, value));
        }
        let rel = relative_to(&workspace.join(&value), workspace);
        declared.outputs.insert(name, rel.display().to_string());
    }

    Ok(declared)
}

/// `__version__` strings of the root package and packages up to two
/// levels below it
pub fn probe_versions(root: &Path) -> String {
    let Ok(pattern) = Regex::new(r#"(?m)^__version__\s*=\s*['"]([^'"]*)['"]"#) else {
        return NO_VERSION.to_string();
    };

    let mut found: Vec<String> = Vec::new();
    let dirs = WalkDir::new(root)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir());
    for dir in dirs {
        for file in ["__main__.py", "__init__.py"] {
            let Ok(contents) = fs::read_to_string(dir.path().join(file)) else {
                continue;
            };
            if let Some(version) = pattern.captures(&contents).and_then(|c| c.get(1)) {
                let label = if dir.depth() == 0 {
                    String::new()
                } else {
                    format!("{}: ", dir.file_name().to_string_lossy())
                };
                found.push(format!("{}version: {}", label, version.as_str()));
                break;
            }
        }
    }

    if found.is_empty() {
        NO_VERSION.to_string()
    } else {
        found.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::{LibraryRecord, LibraryStatus};
    use crate::testing::{FakeLauncher, Fixture};

    const MANIFEST: &str = "[Root]\nRootDir = /somewhere/else\n\n[inputs]\nweather = ${Root:RootDir}/data/weather.csv\nprices = ${Root:RootDir}/data/prices.csv\n\n[outputs]\nresult = ${Root:RootDir}/out/result.csv\n";

    fn archive_request(fx: &Fixture, name: &str, files: &[(&str, &str)]) -> InstallRequest {
        InstallRequest {
            name: name.to_string(),
            source: SourceRequest::Archive(fx.zip_upload(&format!("{}.zip", name), files)),
            python_version: "3.10".into(),
            libraries: Vec::new(),
            default_args: "main.py".into(),
            test_command: None,
        }
    }

    fn program(fx: &Fixture, name: &str) -> ProgramRecord {
        fx.host
            .tables()
            .programs
            .find(|r| r.name == name)
            .unwrap()
            .unwrap()
    }

    fn library(name: &str, used_by: &[&str]) -> LibraryRecord {
        LibraryRecord {
            name: name.to_string(),
            path_to_exec: "bin".into(),
            upload_date: timestamp(),
            zip_path: format!("{}.zip", name),
            orig_filename: format!("{}.zip", name),
            status: LibraryStatus::Installed,
            size: "1 KB".into(),
            comment: String::new(),
            used_by: used_by.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_request_install_writes_record_and_launches() {
        let fx = Fixture::new();
        let request = archive_request(&fx, "foo", &[("foo/main.py", "print(1)")]);

        let submission = fx.host.request_install(request).unwrap();
        assert_eq!(submission, Submission::Started { pid: fx.launcher.pid });

        let record = program(&fx, "foo");
        assert_eq!(record.status, ProgramStatus::Installing);
        assert_eq!(record.pid, Some(fx.launcher.pid));
        assert!(is_alive(record.pid.unwrap()));
        assert!(fx.host.config().program_dir("foo").is_dir());
        assert!(fx.host.config().programs_dir().join(&record.zip_fname).is_file());

        let launches = fx.launcher.launches();
        assert_eq!(launches.len(), 1);
        let tail = ["worker".to_string(), "install".to_string(), "foo".to_string()];
        assert!(launches[0].0.args.ends_with(&tail));
        assert_eq!(launches[0].1, fx.host.config().program_dir("foo").join(INSTALL_LOG));
    }

    #[test]
    fn test_request_install_rejections() {
        let fx = Fixture::new();
        let first = archive_request(&fx, "foo", &[("main.py", "")]);
        assert!(matches!(fx.host.request_install(first.clone()).unwrap(), Submission::Started { .. }));

        // same name again
        let again = fx.host.request_install(first.clone()).unwrap();
        assert!(matches!(again, Submission::Rejected(msg) if msg.contains("already in use")));

        let rar = fx.upload_path("bar.rar");
        fs::write(&rar, "x").unwrap();
        let bad_type = InstallRequest {
            name: "bar".into(),
            source: SourceRequest::Archive(rar),
            ..first.clone()
        };
        assert!(matches!(fx.host.request_install(bad_type).unwrap(), Submission::Rejected(_)));

        let no_ref = InstallRequest {
            name: "baz".into(),
            source: SourceRequest::Git {
                url: "https://example.org/baz.git".into(),
                reference: Some("  ".into()),
            },
            ..first.clone()
        };
        assert!(matches!(fx.host.request_install(no_ref).unwrap(), Submission::Rejected(_)));

        let bad_name = InstallRequest {
            name: "../..".into(),
            ..first
        };
        assert!(matches!(fx.host.request_install(bad_name).unwrap(), Submission::Rejected(_)));

        // rejections leave nothing behind
        let names: Vec<String> = fx
            .host
            .tables()
            .programs
            .load()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["foo"]);
        assert!(!fx.host.config().program_dir("baz").exists());
    }

    #[test]
    fn test_launch_failure_rolls_back() {
        let fx = Fixture::with_launcher(FakeLauncher::failing());
        let request = archive_request(&fx, "foo", &[("main.py", "")]);
        assert!(fx.host.request_install(request).is_err());
        assert!(fx.host.tables().programs.load().unwrap().is_empty());
        assert!(!fx.host.config().program_dir("foo").exists());
    }

    #[tokio::test]
    async fn test_install_from_archive() {
        let fx = Fixture::new();
        let request = archive_request(
            &fx,
            "foo",
            &[
                ("foo-1.0/main.py", "print(1)"),
                ("foo-1.0/requirements.txt", "numpy"),
                ("foo-1.0/foo/__init__.py", "__version__ = '1.0.2'\n"),
                ("foo-1.0/data/weather.csv", "t\n1"),
                ("foo-1.0/config/MasterConfig.cfg", MANIFEST),
            ],
        );
        fx.host.request_install(request).unwrap();
        fx.runner
            .watch_program(&fx.host.config().programs_table(), "foo");

        let code = fx.host.perform_install("foo").await.unwrap();
        assert_eq!(code, 0);

        let record = program(&fx, "foo");
        assert_eq!(record.status, ProgramStatus::Installed);
        assert_eq!(record.pid, None);
        assert_eq!(record.version, "foo: version: 1.0.2");
        assert_eq!(record.inputs["weather"], Some("data/weather.csv".to_string()));
        assert_eq!(record.inputs["prices"], None);
        assert_eq!(record.outputs["result"], "out/result.csv");

        let workspace = fx.host.config().program_dir("foo");
        assert!(workspace.join("main.py").is_file());
        let manifest = Manifest::load(&workspace.join(PROGRAM_MANIFEST)).unwrap();
        assert_eq!(
            manifest.get("Root", "RootDir").unwrap().unwrap(),
            workspace.display().to_string()
        );

        let calls = fx.runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("conda create -y -n foo python=3.10"));
        assert!(calls[1].contains("conda activate foo && pip install -r requirements.txt"));
        assert_eq!(fx.runner.observed(), vec!["creating conda env", "installing packages"]);

        // uploaded sources are not re-archived
        let zips: Vec<_> = fs::read_dir(fx.host.config().programs_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".zip"))
            .collect();
        assert_eq!(zips.len(), 1);
    }

    #[tokio::test]
    async fn test_install_from_git() {
        let fx = Fixture::new();
        fx.runner.on("clone", |cmd| {
            let dest = PathBuf::from(cmd.args.last().unwrap());
            fs::create_dir_all(&dest).unwrap();
            fs::write(dest.join("setup.py"), "from setuptools import setup").unwrap();
        });
        fx.runner.watch_program(&fx.host.config().programs_table(), "bar");

        let request = InstallRequest {
            name: "bar".into(),
            source: SourceRequest::Git {
                url: "https://example.org/bar.git".into(),
                reference: Some("v2".into()),
            },
            python_version: "3.11".into(),
            libraries: Vec::new(),
            default_args: String::new(),
            test_command: Some("python -m pytest -q".into()),
        };
        fx.host.request_install(request).unwrap();
        assert_eq!(fx.host.perform_install("bar").await.unwrap(), 0);

        let record = program(&fx, "bar");
        assert_eq!(record.status, ProgramStatus::Installed);
        assert_eq!(record.version, NO_VERSION);
        assert!(fx.host.config().programs_dir().join(&record.zip_fname).is_file());
        assert!(fx.host.config().program_dir("bar").join("setup.py").is_file());

        let calls = fx.runner.calls();
        assert!(calls[0].starts_with("git clone https://example.org/bar.git"));
        assert!(calls[1].ends_with("checkout v2"));
        assert!(calls[2].ends_with("submodule update --init --recursive"));
        assert!(calls.iter().any(|c| c.contains("pip install .")));
        assert!(calls.iter().any(|c| c.contains("&& python -m pytest -q")));
        assert_eq!(
            fx.runner.observed(),
            vec![
                "getting the files",
                "getting the files",
                "getting the files",
                "creating conda env",
                "installing packages",
                "running self-test",
            ]
        );

        // scratch clone is gone
        let leftovers: Vec<_> = fs::read_dir(fx.host.config().programs_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_escaping_output_is_a_validation_failure() {
        let fx = Fixture::new();
        let request = archive_request(
            &fx,
            "esc",
            &[
                ("main.py", ""),
                ("config/MasterConfig.cfg", "[outputs]\nresult = ../../outside.csv\n"),
            ],
        );
        fx.host.request_install(request).unwrap();

        let code = fx.host.perform_install("esc").await.unwrap();
        assert_eq!(code, 3);
        let record = program(&fx, "esc");
        assert_eq!(record.status, ProgramStatus::Failed(3));
        assert_eq!(record.pid, None);
        // never reached environment creation
        assert!(fx.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_command_marks_error_and_keeps_log() {
        let fx = Fixture::new();
        fx.runner.fail_on("conda create");
        let request = archive_request(&fx, "foo", &[("main.py", "")]);
        fx.host.request_install(request).unwrap();
        let log = fx.host.config().program_dir("foo").join(INSTALL_LOG);
        fs::write(&log, "worker output\n").unwrap();

        assert_eq!(fx.host.perform_install("foo").await.unwrap(), 1);
        assert_eq!(program(&fx, "foo").status, ProgramStatus::Failed(1));
        assert_eq!(fs::read_to_string(&log).unwrap(), "worker output\n");
    }

    #[tokio::test]
    async fn test_interrupted_install() {
        use std::sync::Arc;
        use std::time::Duration;

        let fx = Fixture::new();
        fx.runner.slow_on("conda create", Duration::from_secs(30));
        fx.host
            .request_install(archive_request(&fx, "foo", &[("main.py", "")]))
            .unwrap();

        let host = Arc::clone(&fx.host);
        let worker = tokio::spawn(async move { host.perform_install("foo").await });
        for _ in 0..500 {
            if !fx.runner.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(program(&fx, "foo").status, ProgramStatus::CreatingEnv);

        fx.host.interrupt();
        assert_eq!(worker.await.unwrap().unwrap(), 4);
        let record = program(&fx, "foo");
        assert_eq!(record.status.to_string(), "Installed with error (4)");
        assert_eq!(record.pid, None);
    }

    #[tokio::test]
    async fn test_killed_step_counts_as_interrupted() {
        let fx = Fixture::new();
        fx.runner.respond("pip install", crate::runner::KILLED_BY_SIGNAL, "");
        fx.host
            .request_install(archive_request(&fx, "foo", &[("main.py", ""), ("requirements.txt", "numpy\n")]))
            .unwrap();

        assert_eq!(fx.host.perform_install("foo").await.unwrap(), 4);
        assert_eq!(program(&fx, "foo").status, ProgramStatus::Failed(4));
    }

    #[tokio::test]
    async fn test_libraries_are_linked_and_recorded() {
        let fx = Fixture::new();
        fx.host
            .tables()
            .libraries
            .save(&[library("libA", &["other"]), library("libB", &[])])
            .unwrap();

        let mut request = archive_request(&fx, "foo", &[("main.py", "")]);
        request.libraries = vec!["libA".into(), "missing".into()];
        fx.host.request_install(request).unwrap();
        assert_eq!(fx.host.perform_install("foo").await.unwrap(), 0);

        let link = fx
            .runner
            .calls()
            .into_iter()
            .find(|c| c.contains("develop"))
            .unwrap();
        assert!(link.contains("libA/bin"));
        let libs = fx.host.tables().libraries.load().unwrap();
        assert_eq!(libs[0].used_by, vec!["other", "foo"]);
        assert!(libs[1].used_by.is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_is_idempotent() {
        let fx = Fixture::new();
        fx.installed_program("foo", &[("main.py", "")], &[], &[]);
        fx.host
            .tables()
            .libraries
            .save(&[library("libA", &["foo", "bar"])])
            .unwrap();
        fx.runner
            .respond("env list", 0, r#"{"envs": ["/opt/conda", "/opt/conda/envs/foo"]}"#);

        let first = fx.host.request_uninstall("foo").await.unwrap();
        assert_eq!(first.code, UNINSTALL_OK, "{}", first.output);
        assert!(!fx.host.config().program_dir("foo").exists());
        assert!(fx.host.tables().programs.load().unwrap().is_empty());
        assert_eq!(fx.host.tables().libraries.load().unwrap()[0].used_by, vec!["bar"]);
        assert!(fx.runner.calls().iter().any(|c| c.contains("env remove -y -n foo")));

        let second = fx.host.request_uninstall("foo").await.unwrap();
        assert_eq!(second.code, UNINSTALL_ALREADY_REMOVED);
        assert!(!fx.host.config().program_dir("foo").exists());
        assert!(fx.host.tables().programs.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_failure_reinserts_record() {
        let fx = Fixture::new();
        fx.installed_program("foo", &[("main.py", "")], &[], &[]);
        fx.runner.fail_on("env remove");

        let report = fx.host.request_uninstall("foo").await.unwrap();
        assert_eq!(report.code, UNINSTALL_FAILED);
        assert_eq!(program(&fx, "foo").status, ProgramStatus::UninstallError);

        let log = fs::read_to_string(fx.host.config().program_dir("foo").join(INSTALL_LOG)).unwrap();
        assert!(log.starts_with("installed\n"));
        assert!(log.contains("Error uninstalling program foo"));
    }

    #[tokio::test]
    async fn test_uninstall_skips_missing_env() {
        let fx = Fixture::new();
        fx.installed_program("foo", &[("main.py", "")], &[], &[]);
        fx.runner.respond("env list", 0, r#"{"envs": ["/opt/conda"]}"#);

        let report = fx.host.request_uninstall("foo").await.unwrap();
        assert_eq!(report.code, UNINSTALL_OK);
        assert!(!fx.runner.calls().iter().any(|c| c.contains("env remove")));
    }

    #[tokio::test]
    async fn test_uninstall_refuses_running_install() {
        let fx = Fixture::new();
        let request = archive_request(&fx, "foo", &[("main.py", "")]);
        fx.host.request_install(request).unwrap();

        let report = fx.host.request_uninstall("foo").await.unwrap();
        assert_eq!(report.code, UNINSTALL_FAILED);
        assert_eq!(program(&fx, "foo").status, ProgramStatus::Installing);
    }

    #[test]
    fn test_probe_versions() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("__init__.py"), "__version__ = \"0.3\"\n").unwrap();
        fs::create_dir_all(dir.path().join("pkg/sub")).unwrap();
        fs::write(dir.path().join("pkg/__main__.py"), "__version__ = '1.1'\n").unwrap();
        fs::write(dir.path().join("pkg/sub/__init__.py"), "__version__ = '2.0'\n").unwrap();

        assert_eq!(
            probe_versions(dir.path()),
            "version: 0.3; pkg: version: 1.1; sub: version: 2.0"
        );
    }
}
