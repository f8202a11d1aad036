//! Program installation and run orchestration for a GEP host.
//!
//! Programs are uploaded Python projects that get their own conda
//! environment; runs execute a program with per-run inputs in a private
//! workspace. All state lives in CSV tables under the host root, and the
//! long-running work happens in detached `gep-host worker` processes.

pub mod admission;
pub mod archive;
pub mod config;
pub mod error;
pub mod files;
pub mod host;
pub mod install;
pub mod library;
pub mod manifest;
pub mod notify;
pub mod process;
pub mod run;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod sysload;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use config::HostConfig;
pub use error::{Failure, HostError};
pub use host::{Activity, Host, Submission};
