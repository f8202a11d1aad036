use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use gep_host::files::file_hash;
use gep_host::install::{InstallRequest, SourceRequest};
use gep_host::library::{LibraryDeletion, LibraryRequest};
use gep_host::run::{InputSelection, RunInputs, RunRequest};
use gep_host::{Host, HostConfig, HostError, Submission};

#[derive(Parser)]
#[command(name = "gep-host", version, about = "GEP host program and run orchestrator")]
struct Cli {
    /// Host configuration (falls back to $GEP_HOST_CONFIG, then config/host.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a program from an archive or a git repository
    Install {
        name: String,
        /// Uploaded zip/tar archive
        #[arg(long, conflicts_with = "git", required_unless_present = "git")]
        archive: Option<PathBuf>,
        #[arg(long, requires = "reference")]
        git: Option<String>,
        /// Branch, tag or commit to check out
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(long)]
        python: String,
        #[arg(long = "lib")]
        libraries: Vec<String>,
        #[arg(long, default_value = "")]
        args: String,
        #[arg(long)]
        test_command: Option<String>,
    },
    Uninstall {
        name: String,
    },
    /// Set up and start a run
    Run {
        program: String,
        purpose: String,
        /// Use the program's default for an input
        #[arg(long)]
        inherit: Vec<String>,
        /// NAME=PATH of a file to upload for an input
        #[arg(long, value_parser = parse_pair)]
        upload: Vec<(String, PathBuf)>,
        /// NAME=FILE of a registered file
        #[arg(long, value_parser = parse_pair)]
        registered: Vec<(String, PathBuf)>,
        /// Archive with MasterInput.cfg at its root; replaces per-input options
        #[arg(long, conflicts_with_all = ["inherit", "upload", "registered"])]
        master: Option<PathBuf>,
        #[arg(long, default_value = "")]
        args: String,
        /// Addresses to notify, in any free-text form
        #[arg(long, default_value = "")]
        notify: String,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Stop a run and everything it started
    Stop {
        program: String,
        purpose: String,
    },
    DeleteRun {
        program: String,
        purpose: String,
    },
    /// Print a MasterInput.cfg template for a program
    Template {
        program: String,
    },
    #[command(subcommand)]
    Library(LibraryCommand),
    #[command(subcommand)]
    File(FileCommand),
    /// Mark records whose worker process is gone
    Reconcile,
    /// Show installs and runs in progress
    Status,
    /// Detached worker entry points
    #[command(subcommand, hide = true)]
    Worker(WorkerCommand),
}

#[derive(Subcommand)]
enum LibraryCommand {
    Add {
        name: String,
        archive: PathBuf,
        /// Directory inside the library handed to `conda develop`
        #[arg(long, default_value = "")]
        path_to_exec: String,
        #[arg(long, default_value = "")]
        comment: String,
    },
    Delete {
        name: String,
    },
}

#[derive(Subcommand)]
enum FileCommand {
    Upload {
        path: PathBuf,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Register a file in place
    Register {
        path: PathBuf,
        #[arg(long, default_value = "")]
        comment: String,
    },
    Delete {
        name: String,
    },
    /// Print the SHA-256 used for deduplication
    Hash {
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    Install { name: String },
    Run { program: String, purpose: String },
}

fn parse_pair(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() && !value.is_empty() => {
            Ok((name.to_string(), PathBuf::from(value)))
        }
        _ => Err(format!("expected NAME=VALUE, got {:?}", raw)),
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

fn report_submission(submission: Submission) -> ExitCode {
    match submission {
        Submission::Started { pid } => {
            println!("started (pid {})", pid);
            ExitCode::SUCCESS
        }
        Submission::Rejected(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let worker_mode = matches!(cli.command, Commands::Worker(_));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gep_host=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        // worker output goes to a log file
        .with_ansi(!worker_mode)
        .init();

    match run_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            if let Some(HostError::Rejected(message)) = e.downcast_ref::<HostError>() {
                eprintln!("{}", message);
            } else {
                error!("{:?}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run_command(cli: Cli) -> Result<ExitCode> {
    let config_path = HostConfig::resolve_path(cli.config);
    let config = HostConfig::load(&config_path)?;
    let host = Host::open(config)?;

    match cli.command {
        Commands::Install {
            name,
            archive,
            git,
            reference,
            python,
            libraries,
            args,
            test_command,
        } => {
            let source = match (archive, git) {
                (Some(path), _) => SourceRequest::Archive(path),
                (None, Some(url)) => SourceRequest::Git { url, reference },
                (None, None) => bail!("either --archive or --git is required"),
            };
            let request = InstallRequest {
                name,
                source,
                python_version: python,
                libraries,
                default_args: args,
                test_command,
            };
            Ok(report_submission(host.request_install(request)?))
        }
        Commands::Uninstall { name } => {
            let report = host.request_uninstall(&name).await?;
            println!("{}", report.output);
            Ok(exit_code(report.code))
        }
        Commands::Run {
            program,
            purpose,
            inherit,
            upload,
            registered,
            master,
            args,
            notify,
            comment,
        } => {
            let inputs = match master {
                Some(path) => RunInputs::Master {
                    file_name: file_name(&path)?,
                    data: std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?,
                },
                None => {
                    let mut selection = BTreeMap::new();
                    for name in inherit {
                        selection.insert(name, InputSelection::Inherit);
                    }
                    for (name, path) in upload {
                        let data =
                            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
                        selection.insert(
                            name,
                            InputSelection::Upload {
                                file_name: file_name(&path)?,
                                data,
                            },
                        );
                    }
                    for (name, file) in registered {
                        selection.insert(name, InputSelection::Registered(file.display().to_string()));
                    }
                    RunInputs::PerInput(selection)
                }
            };
            let request = RunRequest {
                program,
                purpose,
                inputs,
                args,
                notifications: notify,
                comment,
            };
            Ok(report_submission(host.request_run(request).await?))
        }
        Commands::Stop { program, purpose } => {
            let report = host.request_stop(&program, &purpose).await?;
            println!("{:?}", report.outcome);
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::DeleteRun { program, purpose } => {
            let report = host.request_delete(&program, &purpose)?;
            println!("{}", report.output);
            Ok(exit_code(report.code))
        }
        Commands::Template { program } => {
            print!("{}", host.input_template(&program)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Library(LibraryCommand::Add {
            name,
            archive,
            path_to_exec,
            comment,
        }) => {
            let record = host.add_library(LibraryRequest {
                name,
                archive,
                path_to_exec,
                comment,
            })?;
            println!("library {} added ({})", record.name, record.size);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Library(LibraryCommand::Delete { name }) => {
            match host.delete_library(&name)? {
                LibraryDeletion::Removed => println!("library {} deleted", name),
                LibraryDeletion::MarkedDeleted { used_by } => println!(
                    "library {} is still required by {}; marked deleted until they are uninstalled",
                    name,
                    used_by.join(", ")
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::File(FileCommand::Upload { path, comment }) => {
            let record = host.upload_file(&path, &comment)?;
            println!("{} uploaded ({})", record.filename, record.size);
            Ok(ExitCode::SUCCESS)
        }
        Commands::File(FileCommand::Register { path, comment }) => {
            let record = host.register_path(&path, &comment)?;
            println!("{} registered", record.filename);
            Ok(ExitCode::SUCCESS)
        }
        Commands::File(FileCommand::Delete { name }) => {
            host.delete_file(&name)?;
            println!("{} deleted", name);
            Ok(ExitCode::SUCCESS)
        }
        Commands::File(FileCommand::Hash { path }) => {
            println!("{}", file_hash(&path)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reconcile => {
            let report = host.reconcile()?;
            info!(
                "Reconciled {} installs and {} runs",
                report.programs.len(),
                report.runs.len()
            );
            for name in report.programs {
                println!("program {}", name);
            }
            for id in report.runs {
                println!("run {}", id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let activity = host.activity()?;
            println!(
                "{} installing, {} set up, {} queued, {} running",
                activity.installing, activity.pending, activity.queued, activity.running
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker(WorkerCommand::Install { name }) => Ok(exit_code(host.perform_install(&name).await?)),
        Commands::Worker(WorkerCommand::Run { program, purpose }) => {
            Ok(exit_code(host.perform_run(&program, &purpose).await?))
        }
    }
}

fn file_name(path: &std::path::Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", path.display()))
}
