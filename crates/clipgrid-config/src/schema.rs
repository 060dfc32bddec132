// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `1.0`.
///
/// `#[serde(default)]` on an `f32` falls back to `0.0`, which is not the
/// sampling temperature the application ships with, so a named function is
/// required.
fn default_temperature() -> f32 {
    1.0
}

fn default_max_flow_steps() -> usize {
    5
}

fn default_limiter_capacity() -> usize {
    5
}

/// Reasoning-effort setting forwarded to providers that support a thinking
/// budget.  The driver maps each level to a provider-specific budget value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThinkingLevel {
    /// Thinking disabled; lowest latency.
    Fast,
    /// Provider-chosen dynamic budget.
    #[default]
    Balanced,
    /// Large fixed budget.
    HighQuality,
    /// No budget cap.
    Unlimited,
}

/// Sampling parameters passed through verbatim to the remote client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: None,
            top_k: None,
            max_output_tokens: None,
            stop_sequences: None,
        }
    }
}

impl GenerationParams {
    /// Params with only a temperature set, as used by ad-hoc free-input runs.
    pub fn with_temperature(temperature: f32) -> Self {
        Self { temperature, ..Self::default() }
    }
}

/// One configured prompt.  Engines receive immutable snapshots of this —
/// in-flight tasks are unaffected by concurrent edits in the configuration UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSpec {
    pub name: String,
    pub model_id: String,
    pub system_instruction: String,
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    /// Attach the provider's web-search tool to calls for this prompt.
    #[serde(default)]
    pub enable_web_tool: bool,
    /// Seed this prompt as a column when a matrix run starts without an
    /// explicit column list.
    #[serde(default)]
    pub include_in_matrix: bool,
    #[serde(default)]
    pub params: GenerationParams,
}

impl PromptSpec {
    pub fn new(name: impl Into<String>, model_id: impl Into<String>, system_instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
            system_instruction: system_instruction.into(),
            thinking_level: ThinkingLevel::default(),
            enable_web_tool: false,
            include_in_matrix: false,
            params: GenerationParams::default(),
        }
    }
}

/// Top-level configuration.
///
/// `version` is the schema version; older files are migrated by the loader
/// before deserialization reaches this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "AppConfig::current_version")]
    pub version: u32,
    #[serde(default)]
    pub prompts: HashMap<String, PromptSpec>,
    /// Upper bound on steps in one flow row.
    #[serde(default = "default_max_flow_steps")]
    pub max_flow_steps: usize,
    /// Capacity of the process-wide remote-call limiter.
    #[serde(default = "default_limiter_capacity")]
    pub limiter_capacity: usize,
    /// Hard timeout applied to each guarded remote call.  `None` disables the
    /// timeout; a hung call then occupies a limiter slot until it returns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
}

impl AppConfig {
    const fn current_version() -> u32 {
        7
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: Self::current_version(),
            prompts: HashMap::new(),
            max_flow_steps: default_max_flow_steps(),
            limiter_capacity: default_limiter_capacity(),
            call_timeout_secs: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
