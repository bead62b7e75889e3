use crate::error::ChatError;
use anyhow::Context;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const RULE: &str = "============================================================";
const THIN_RULE: &str = "------------------------------------------------------------";

pub struct Transcript {
    path: PathBuf,
    file: File,
}

impl Transcript {
    /// Start a new `conversation_<timestamp>.txt` in `dir`.
    pub fn create(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create transcript directory: {}", dir.display()))?;

        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = dir.join(format!("conversation_{stamp}.txt"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open transcript: {}", path.display()))?;

        let mut t = Self { path, file };
        let header = format!(
            "{RULE}\n           GEMINI CONVERSATION LOG\n{RULE}\nSession Started: {}\nLog File: {}\n{RULE}\n\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            t.path.display()
        );
        t.write(&header);
        Ok(t)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_prompt(&mut self, prompt: &str, model: &str, streaming: bool) {
        let mode = if streaming { "streaming" } else { "buffered" };
        let entry = format!(
            "[{}] PROMPT (model: {model}, {mode})\n{THIN_RULE}\n{prompt}\n\n",
            now()
        );
        self.write(&entry);
    }

    pub fn log_response(&mut self, text: &str, elapsed: Duration, model: &str) {
        let entry = format!(
            "[{}] RESPONSE (model: {model}, {} ms, {} chars)\n{THIN_RULE}\n{text}\n\n",
            now(),
            elapsed.as_millis(),
            text.chars().count()
        );
        self.write(&entry);
    }

    pub fn log_empty(&mut self, elapsed: Duration, model: &str) {
        let entry = format!(
            "[{}] NO CONTENT (model: {model}, {} ms)\n\n",
            now(),
            elapsed.as_millis()
        );
        self.write(&entry);
    }

    pub fn log_error(&mut self, err: &ChatError, model: &str, prompt: &str) {
        let status = err
            .status
            .map(|s| format!(", HTTP {s}"))
            .unwrap_or_default();
        let entry = format!(
            "[{}] ERROR (model: {model}, {:?}{status})\n{THIN_RULE}\nPrompt: {prompt}\nError: {err}\n\n",
            now(),
            err.kind
        );
        self.write(&entry);
    }

    pub fn log_command(&mut self, command: &str) {
        let entry = format!("[{}] COMMAND: {command}\n\n", now());
        self.write(&entry);
    }

    /// A broken transcript must not end the session; warn and carry on.
    fn write(&mut self, s: &str) {
        if let Err(e) = self.file.write_all(s.as_bytes()).and_then(|_| self.file.flush()) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to write transcript");
        }
    }
}

fn now() -> impl std::fmt::Display {
    Local::now().format("%Y-%m-%d %H:%M:%S")
}
