// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "clipgrid",
    about = "Clipboard-to-LLM dispatch core with a matrix batch engine",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (RUST_LOG still wins when set)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one single-shot action against text input (stdin stand-in for the
    /// clipboard) or attached files
    Run {
        /// Configured prompt id to run
        #[arg(long, short = 'p')]
        prompt: Option<String>,

        /// Ad-hoc system instruction (alternative to --prompt)
        #[arg(long, short = 's')]
        system: Option<String>,

        /// Model for ad-hoc runs
        #[arg(long, short = 'M', default_value = "gemini-2.5-flash-lite")]
        model: String,

        /// Sampling temperature for ad-hoc runs
        #[arg(long, short = 't', default_value_t = 1.0)]
        temperature: f32,

        /// Attach a file instead of reading input text; may be repeated
        #[arg(long, short = 'f')]
        file: Vec<PathBuf>,

        /// Input text; read from stdin when omitted and no files are attached
        input: Option<String>,
    },

    /// Run a matrix batch described by a JSON file
    Matrix {
        /// Batch description: {"inputs": [...], "prompts": [...]}
        spec: PathBuf,

        /// Chain the selected columns per row instead of fanning out
        #[arg(long)]
        flow: bool,

        /// Cap flow chains at this many steps (default: from config)
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Print the resolved configuration
    ShowConfig,
}
