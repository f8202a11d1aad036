//! Test doubles for the host seams

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::config::HostConfig;
use crate::host::Host;
use crate::notify::{Message, Notifier};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec, Launcher, ProcessHandle};
use crate::store::records::{ProgramRecord, ProgramSource, ProgramStatus};
use crate::store::Table;
use crate::sysload::LoadProbe;

type Effect = Box<dyn Fn(&CommandSpec) + Send + Sync>;

struct Rule {
    pattern: String,
    code: i32,
    output: String,
    delay: Option<Duration>,
    effect: Option<Effect>,
}

/// Records commands and answers them from rules matched by substring
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
    watch: Mutex<Option<(PathBuf, String)>>,
    observed: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, code: i32, output: &str, delay: Option<Duration>, effect: Option<Effect>) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            code,
            output: output.to_string(),
            delay,
            effect,
        });
    }

    pub fn respond(&self, pattern: &str, code: i32, output: &str) {
        self.push(pattern, code, output, None, None);
    }

    pub fn fail_on(&self, pattern: &str) {
        self.push(pattern, 1, "simulated failure", None, None);
    }

    pub fn slow_on(&self, pattern: &str, delay: Duration) {
        self.push(pattern, 0, "", Some(delay), None);
    }

    pub fn on(&self, pattern: &str, effect: impl Fn(&CommandSpec) + Send + Sync + 'static) {
        self.respond_with(pattern, 0, effect);
    }

    /// Run `effect`, then exit with `code`
    pub fn respond_with(&self, pattern: &str, code: i32, effect: impl Fn(&CommandSpec) + Send + Sync + 'static) {
        self.push(pattern, code, "", None, Some(Box::new(effect)));
    }

    /// Record the status of `program` every time a command runs
    pub fn watch_program(&self, table: &Path, program: &str) {
        *self.watch.lock().unwrap() = Some((table.to_path_buf(), program.to_string()));
    }

    pub fn observed(&self) -> Vec<String> {
        self.observed.lock().unwrap().clone()
    }

    /// Command lines run so far
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.clone());

        let watch = self.watch.lock().unwrap().clone();
        if let Some((table, program)) = watch {
            let table: Table<ProgramRecord> = Table::open(table)?;
            if let Some(record) = table.find(|r| r.name == program)? {
                self.observed.lock().unwrap().push(record.status.to_string());
            }
        }

        let line = cmd.to_string();
        let (code, output, delay) = {
            let rules = self.rules.lock().unwrap();
            match rules.iter().find(|r| line.contains(&r.pattern)) {
                Some(rule) => {
                    if let Some(effect) = &rule.effect {
                        effect(cmd);
                    }
                    (rule.code, rule.output.clone(), rule.delay)
                }
                None => (0, String::new(), None),
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(CommandOutput { code, output })
    }
}

/// Records launches instead of starting processes
pub struct FakeLauncher {
    pub pid: u32,
    pub fail: bool,
    launches: Mutex<Vec<(CommandSpec, PathBuf)>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            // a pid that is certainly alive
            pid: std::process::id(),
            fail: false,
            launches: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLauncher {
    /// A launcher whose every spawn fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> Vec<(CommandSpec, PathBuf)> {
        self.launches.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, cmd: &CommandSpec, log_path: &Path) -> Result<ProcessHandle> {
        if self.fail {
            bail!("No such file or directory");
        }
        self.launches
            .lock()
            .unwrap()
            .push((cmd.clone(), log_path.to_path_buf()));
        Ok(ProcessHandle { pid: self.pid })
    }
}

/// Load probe returning whatever the test sets
#[derive(Default)]
pub struct FixedLoad(AtomicU32);

impl FixedLoad {
    pub fn set(&self, percent: f32) {
        self.0.store(percent.to_bits(), Ordering::SeqCst);
    }
}

#[async_trait]
impl LoadProbe for FixedLoad {
    async fn cpu_percent(&self) -> Result<f32> {
        Ok(f32::from_bits(self.0.load(Ordering::SeqCst)))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Message>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &Message) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// A host on a scratch root with every seam faked
pub struct Fixture {
    pub dir: TempDir,
    pub host: Arc<Host>,
    pub runner: Arc<FakeRunner>,
    pub launcher: Arc<FakeLauncher>,
    pub load: Arc<FixedLoad>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_launcher(FakeLauncher::default())
    }

    pub fn with_launcher(launcher: FakeLauncher) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = HostConfig::with_root(dir.path().join("root"));
        config.source_path = Some(dir.path().join("host.toml"));
        config.admission.poll_interval_ms = 10;
        config.admission.sample_window_ms = 0;
        config.supervisor.stop_timeout_secs = 2;

        let runner = Arc::new(FakeRunner::new());
        let launcher = Arc::new(launcher);
        let load = Arc::new(FixedLoad::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let host = Host::open(config)
            .unwrap()
            .with_runner(runner.clone())
            .with_launcher(launcher.clone())
            .with_probe(load.clone())
            .with_notifier(notifier.clone());

        Self {
            dir,
            host: Arc::new(host),
            runner,
            launcher,
            load,
            notifier,
        }
    }

    /// Path for an upload outside the host root
    pub fn upload_path(&self, name: &str) -> PathBuf {
        let dir = self.dir.path().join("uploads");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    /// Zip `files` into an upload called `name`
    pub fn zip_upload(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = self.upload_path(name);
        write_zip(&path, files);
        path
    }

    /// A program installed without going through the worker
    pub fn installed_program(
        &self,
        name: &str,
        files: &[(&str, &str)],
        inputs: &[(&str, Option<&str>)],
        outputs: &[(&str, &str)],
    ) -> ProgramRecord {
        let workspace = self.host.config().program_dir(name);
        for (path, content) in files {
            let target = workspace.join(path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, content).unwrap();
        }
        fs::write(workspace.join(crate::install::INSTALL_LOG), "installed\n").unwrap();

        let record = ProgramRecord {
            name: name.to_string(),
            upload_date: crate::util::timestamp(),
            python_version: "3.10".into(),
            status: ProgramStatus::Installed,
            pid: None,
            zip_fname: format!("{}.zip", name),
            libraries: Vec::new(),
            default_args: "main.py".into(),
            test_command: None,
            source: ProgramSource::Archive(format!("{}.zip", name)),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(String::from)))
                .collect::<BTreeMap<_, _>>(),
            outputs: outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            version: String::new(),
        };
        self.host
            .tables()
            .programs
            .update(|rows| {
                rows.push(record.clone());
                Ok(())
            })
            .unwrap();
        record
    }
}

pub fn write_zip(path: &Path, files: &[(&str, &str)]) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    for (name, content) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}
