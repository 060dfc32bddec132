// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// One unit of input: a matrix row, or the single-shot snapshot taken when an
/// action fires.  Closed sum — adding a kind is a compile-time-checked change
/// at every match site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputItem {
    Text(String),
    /// Raw clipboard raster bytes; normalized to PNG before a call.
    Image(Vec<u8>),
    /// Local file, uploaded through the remote client when used.
    File(PathBuf),
}

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard is empty")]
    Empty,

    #[error("clipboard read failed: {0}")]
    Read(String),
}

/// Boundary to the platform clipboard (owned by the excluded GUI layer).
///
/// `snapshot` is called on the worker loop; implementations should return
/// quickly and must be callable from a non-GUI thread.
pub trait ClipboardSource: Send + Sync {
    /// Current clipboard content: an image takes priority over text, an empty
    /// clipboard is an error.
    fn snapshot(&self) -> Result<InputItem, ClipboardError>;
}

/// Fixed-content clipboard for the headless CLI and for tests.
pub struct StaticClipboard(pub InputItem);

impl ClipboardSource for StaticClipboard {
    fn snapshot(&self) -> Result<InputItem, ClipboardError> {
        Ok(self.0.clone())
    }
}

/// Read the clipboard with bounded retries and increasing backoff.
///
/// Clipboard access races with the copying application on Windows; three
/// attempts at 100/200/300 ms cover the common contention window.
pub(crate) async fn snapshot_with_retry(
    source: &dyn ClipboardSource,
    attempts: u32,
) -> Result<InputItem, ClipboardError> {
    let mut last_err = ClipboardError::Empty;
    for attempt in 0..attempts {
        match source.snapshot() {
            Ok(item) => return Ok(item),
            Err(e) => {
                debug!(attempt, error = %e, "clipboard read failed");
                last_err = e;
            }
        }
        tokio::time::sleep(Duration::from_millis(100) * (attempt + 1)).await;
    }
    Err(last_err)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
