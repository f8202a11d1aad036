//! Email notifications
//!
//! Messages are handed to the local `sendmail`. A failed notification is
//! logged and never fails the step that triggered it.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::HostConfig;

/// A plaintext message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub body: String,
    pub to: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Send and swallow failures
pub async fn notify(notifier: &dyn Notifier, message: Message) {
    if message.to.is_empty() {
        return;
    }
    if let Err(e) = notifier.send(&message).await {
        warn!("Failed to send notification '{}': {:#}", message.subject, e);
    }
}

/// Pull every address matching `pattern` out of free text
pub fn extract_emails(pattern: &str, text: &str) -> Result<Vec<String>> {
    let re = Regex::new(pattern).with_context(|| format!("Invalid email pattern {}", pattern))?;
    let mut found: Vec<String> = Vec::new();
    for m in re.find_iter(text) {
        let address = m.as_str().to_string();
        if !found.contains(&address) {
            found.push(address);
        }
    }
    Ok(found)
}

/// Delivers through `sendmail -t`
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    sendmail: String,
    sender: String,
    enabled: bool,
}

impl SendmailNotifier {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            sendmail: config.notify.sendmail.clone(),
            sender: config
                .notify
                .sender
                .clone()
                .unwrap_or_else(|| format!("gep_host_service@{}", config.host_name)),
            enabled: config.notify.enabled,
        }
    }

    fn render(&self, message: &Message) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}\n",
            self.sender,
            message.to.join(", "),
            message.subject,
            message.body
        )
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, message: &Message) -> Result<()> {
        if !self.enabled {
            debug!("Notifications disabled, dropping '{}'", message.subject);
            return Ok(());
        }

        let mut child = Command::new(&self.sendmail)
            .args(["-t", "-f", &self.sender])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.sendmail))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.render(message).as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.sendmail,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!("Sent '{}' to {:?}", message.subject, message.to);
        Ok(())
    }
}
