// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use clipgrid_config::{AppConfig, GenerationParams, PriceTable, PromptSpec};
use clipgrid_engine::{
    ActionContext, ActionRequest, ColumnId, EngineEvent, EngineSettings, FlowEngine, InputItem,
    Limiter, MatrixEngine, MatrixGrid, SingleActionRunner, StaticClipboard, WorkerLoop,
};
use clipgrid_model::GoogleClient;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = clipgrid_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run { prompt, system, model, temperature, file, input } => {
            run_single(&config, prompt, system, model, temperature, file, input)
        }
        Commands::Matrix { spec, flow, max_steps } => {
            run_matrix(&config, &spec, flow, max_steps)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ─── Single-shot action ──────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn run_single(
    config: &AppConfig,
    prompt: Option<String>,
    system: Option<String>,
    model: String,
    temperature: f32,
    files: Vec<std::path::PathBuf>,
    input: Option<String>,
) -> anyhow::Result<()> {
    let request = match (&prompt, &system) {
        (Some(id), _) => ActionRequest::prompt(id.clone()),
        (None, Some(instruction)) => ActionRequest::ad_hoc(
            instruction.clone(),
            model,
            GenerationParams::with_temperature(temperature),
        ),
        (None, None) => bail!("one of --prompt or --system is required"),
    }
    .with_files(files.clone());

    // Headless clipboard stand-in: the input text, or stdin.
    let clipboard_text = if files.is_empty() {
        match input {
            Some(text) => text,
            None => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("reading input from stdin")?;
                buf
            }
        }
    } else {
        input.unwrap_or_default()
    };

    let worker = WorkerLoop::start()?;
    let (tx, mut rx) = mpsc::channel::<EngineEvent>(256);
    let context = Arc::new(ActionContext::new(
        config.prompts.clone(),
        load_prices(),
    ));
    let runner = SingleActionRunner::new(
        Arc::new(GoogleClient::from_env()),
        Arc::new(StaticClipboard(InputItem::Text(clipboard_text))),
        context,
        Limiter::new(config.limiter_capacity),
        tx,
        EngineSettings::from_config(config),
    );
    let queue = runner.start(worker.handle());
    queue.enqueue(request);

    // The main thread plays the GUI sink: drain events until the action ends.
    let mut result: Option<Result<String, String>> = None;
    while let Some(event) = rx.blocking_recv() {
        match event {
            EngineEvent::ActionDelta(_) => {}
            EngineEvent::Notify { title, message, level } => {
                tracing::info!(?level, "{title}: {message}");
            }
            EngineEvent::ActionCompleted { text, cost_note, .. } => {
                tracing::info!("{cost_note}");
                result = Some(Ok(text));
                break;
            }
            EngineEvent::ActionFailed { message } => {
                result = Some(Err(message));
                break;
            }
            _ => {}
        }
    }
    queue.shutdown();
    worker.stop();

    match result {
        Some(Ok(text)) => {
            println!("{text}");
            Ok(())
        }
        Some(Err(message)) => bail!("{message}"),
        None => bail!("worker loop ended without a result"),
    }
}

// ─── Matrix / flow batch ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BatchSpec {
    inputs: Vec<BatchInput>,
    /// Prompt ids used as columns; defaults to the configured prompts flagged
    /// with `include_in_matrix`.
    #[serde(default)]
    prompts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchInput {
    Text { text: String },
    File { file: std::path::PathBuf },
    Image { image: std::path::PathBuf },
}

fn run_matrix(
    config: &AppConfig,
    spec_path: &std::path::Path,
    flow: bool,
    max_steps: Option<usize>,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(spec_path)
        .with_context(|| format!("reading {}", spec_path.display()))?;
    let spec: BatchSpec = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", spec_path.display()))?;
    if spec.inputs.is_empty() {
        bail!("batch spec has no inputs");
    }

    let columns = column_prompts(config, &spec.prompts)?;
    if columns.is_empty() {
        bail!("no prompts selected: list ids in the spec or flag prompts with include_in_matrix");
    }

    let mut grid = MatrixGrid::new();
    for input in &spec.inputs {
        let item = match input {
            BatchInput::Text { text } => InputItem::Text(text.clone()),
            BatchInput::File { file } => InputItem::File(file.clone()),
            BatchInput::Image { image } => {
                let bytes = std::fs::read(image)
                    .with_context(|| format!("reading {}", image.display()))?;
                InputItem::Image(bytes)
            }
        };
        grid.add_row(item);
    }
    let mut col_ids: Vec<ColumnId> = Vec::new();
    let mut col_names: Vec<String> = Vec::new();
    for (_, prompt) in &columns {
        col_names.push(prompt.name.clone());
        col_ids.push(grid.add_column(prompt.clone()));
    }
    let rows = grid.rows().len();
    let grid = grid.shared();

    let selection: Vec<(usize, ColumnId)> = (0..rows)
        .flat_map(|r| col_ids.iter().map(move |c| (r, *c)))
        .collect();

    let worker = WorkerLoop::start()?;
    let (tx, mut rx) = mpsc::channel::<EngineEvent>(1024);
    let client = Arc::new(GoogleClient::from_env());
    let limiter = Limiter::new(config.limiter_capacity);
    let settings = EngineSettings::from_config(config);

    if flow {
        let engine = FlowEngine::new(
            Arc::clone(&grid),
            client,
            limiter,
            tx,
            worker.handle().clone(),
            settings,
            max_steps.unwrap_or(config.max_flow_steps),
        );
        let plan = engine.plan(&selection);
        let summary = engine.summarize(&plan);
        for row in &summary.rows {
            eprintln!("row {}: {} steps", row.row + 1, row.cols.len());
        }
        eprintln!("total steps: {}", summary.total_steps);
        engine
            .run(plan)
            .map_err(|e| anyhow::anyhow!("flow run rejected: {e}"))?;
    } else {
        let engine = MatrixEngine::new(
            Arc::clone(&grid),
            client,
            limiter,
            tx,
            worker.handle().clone(),
            settings,
        );
        engine
            .run(selection)
            .map_err(|e| anyhow::anyhow!("matrix run rejected: {e}"))?;
    }

    // Drain until the batch completes, echoing progress to stderr.
    while let Some(event) = rx.blocking_recv() {
        match event {
            EngineEvent::Progress { completed, total } => {
                eprint!("\r{completed}/{total}");
            }
            EngineEvent::Notify { title, message, .. } => {
                tracing::warn!("{title}: {message}");
            }
            EngineEvent::BatchCompleted { .. } => {
                eprintln!();
                break;
            }
            _ => {}
        }
    }
    worker.stop();

    print_grid(&grid, rows, &col_ids, &col_names);
    Ok(())
}

/// Resolve the column prompt set: explicit ids from the spec, or every
/// configured prompt flagged for matrix inclusion (sorted by id).
fn column_prompts(
    config: &AppConfig,
    ids: &[String],
) -> anyhow::Result<Vec<(String, PromptSpec)>> {
    if ids.is_empty() {
        let mut flagged: Vec<(String, PromptSpec)> = config
            .prompts
            .iter()
            .filter(|(_, p)| p.include_in_matrix)
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        flagged.sort_by(|a, b| a.0.cmp(&b.0));
        return Ok(flagged);
    }
    let mut columns = Vec::with_capacity(ids.len());
    for id in ids {
        let prompt = config
            .prompts
            .get(id)
            .with_context(|| format!("prompt '{id}' is not configured"))?;
        columns.push((id.clone(), prompt.clone()));
    }
    Ok(columns)
}

fn load_prices() -> PriceTable {
    let path = clipgrid_config::default_config_path()
        .with_file_name("prices.json");
    PriceTable::load(&path).unwrap_or_default()
}

fn print_grid(
    grid: &clipgrid_engine::SharedGrid,
    rows: usize,
    col_ids: &[ColumnId],
    col_names: &[String],
) {
    let grid = match grid.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    for r in 0..rows {
        println!("── row {} ──", r + 1);
        for (c, id) in col_ids.iter().enumerate() {
            let text = grid
                .cell(r, *id)
                .map(|cell| cell.full_text.as_str())
                .unwrap_or("");
            println!("[{}]", col_names[c]);
            println!("{text}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(id: &str, in_matrix: bool) -> AppConfig {
        let mut config = AppConfig::default();
        let mut prompt = PromptSpec::new("Name", "gemini-2.5-flash-lite", "sys");
        prompt.include_in_matrix = in_matrix;
        config.prompts.insert(id.to_string(), prompt);
        config
    }

    #[test]
    fn batch_spec_parses_all_input_kinds() {
        let spec: BatchSpec = serde_json::from_str(
            r#"{
                "inputs": [
                    {"text": "hello"},
                    {"file": "notes.pdf"},
                    {"image": "shot.png"}
                ],
                "prompts": ["a"]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.inputs.len(), 3);
        assert_eq!(spec.prompts, vec!["a"]);
        assert!(matches!(spec.inputs[0], BatchInput::Text { .. }));
        assert!(matches!(spec.inputs[2], BatchInput::Image { .. }));
    }

    #[test]
    fn column_prompts_rejects_unknown_ids() {
        let config = config_with("known", false);
        assert!(column_prompts(&config, &["unknown".into()]).is_err());
        assert_eq!(column_prompts(&config, &["known".into()]).unwrap().len(), 1);
    }

    #[test]
    fn column_prompts_defaults_to_matrix_flagged() {
        let config = config_with("flagged", true);
        let cols = column_prompts(&config, &[]).unwrap();
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].0, "flagged");

        let config = config_with("unflagged", false);
        assert!(column_prompts(&config, &[]).unwrap().is_empty());
    }
}
