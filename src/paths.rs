use anyhow::Context;
use std::env;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "gemini-chat";

/// Settings and transcripts live under `$GEMINI_CHAT_HOME` when it is set,
/// otherwise under the XDG locations, otherwise under the home directory.
fn user_home() -> anyhow::Result<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .context("neither HOME nor USERPROFILE is set; set GEMINI_CHAT_HOME instead")
}

fn ensure_dir(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

fn app_home() -> Option<PathBuf> {
    env::var_os("GEMINI_CHAT_HOME").map(PathBuf::from)
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = app_home() {
        return ensure_dir(&base.join("config"));
    }

    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join(APP_DIR));
    }

    ensure_dir(&user_home()?.join(".config").join(APP_DIR))
}

pub fn state_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = app_home() {
        return ensure_dir(&base.join("state"));
    }

    if let Some(xdg) = env::var_os("XDG_STATE_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join(APP_DIR));
    }

    ensure_dir(&user_home()?.join(".local").join("state").join(APP_DIR))
}

pub fn transcripts_dir() -> anyhow::Result<PathBuf> {
    ensure_dir(&state_dir()?.join("transcripts"))
}
