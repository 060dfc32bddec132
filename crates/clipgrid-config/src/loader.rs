// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::AppConfig;

/// Default on-disk location: `<config_dir>/clipgrid/config.json`.
///
/// Falls back to the current directory when no platform config directory is
/// available (headless CI containers).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clipgrid")
        .join("config.json")
}

/// Load configuration from `explicit` (e.g. a `--config` flag) or from the
/// default path.  A missing file yields the built-in defaults; a present but
/// malformed file is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    if !path.is_file() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(AppConfig::default());
    }
    debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Persist configuration as pretty-printed JSON, creating parent directories
/// as needed.
pub fn save(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(config).context("serializing config")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PromptSpec;

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(Some(&dir.path().join("nope.json"))).unwrap();
        assert!(cfg.prompts.is_empty());
    }

    #[test]
    fn load_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load(Some(&path)).is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let mut cfg = AppConfig::default();
        cfg.prompts.insert(
            "t".into(),
            PromptSpec::new("Translate", "gemini-2.5-flash", "Translate to English."),
        );
        save(&cfg, &path).unwrap();
        let back = load(Some(&path)).unwrap();
        assert_eq!(back.prompts["t"].name, "Translate");
    }
}
