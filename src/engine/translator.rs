//! Translation through an external command.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::Translator;

pub const TARGET_LANGUAGE_ENV: &str = "AUTOSCRIBE_TARGET_LANGUAGE";

/// Pipes text to `sh -c <command>` and reads the translation from stdout.
/// The child is killed if the call is dropped, so a cancelled drain does not
/// leave processes behind.
pub struct CommandTranslator {
    command: String,
    timeout: Duration,
}

impl CommandTranslator {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl Translator for CommandTranslator {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(TARGET_LANGUAGE_ENV, target_language)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn translate command")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .context("Failed to write to translate command")?;
            // Dropping stdin signals EOF
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Translate command timed out after {:?}", self.timeout))?
            .context("Translate command failed to run")?;

        if !output.status.success() {
            bail!(
                "Translate command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let translated = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Translated {} chars to {}", text.len(), target_language);
        Ok(translated)
    }
}
