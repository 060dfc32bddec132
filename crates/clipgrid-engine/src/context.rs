// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use clipgrid_config::{GenerationParams, PriceTable, PromptSpec};

/// The most recent successful single-action result, kept so a later "refine"
/// can reuse the same prompt configuration and feed the previous output back
/// as context.  Failed actions never overwrite this.
#[derive(Debug, Clone)]
pub struct LastResult {
    pub text: String,
    pub prompt: PromptSpec,
    pub params: GenerationParams,
}

/// Explicitly owned application context shared by the engines.
///
/// Replaces the source's ambient globals: created once at application start,
/// passed into the runner/engine constructors, torn down at shutdown.  Prompt
/// lookups return clones so in-flight tasks hold stable snapshots while the
/// configuration UI edits the live set.
pub struct ActionContext {
    prompts: RwLock<HashMap<String, PromptSpec>>,
    last_result: Mutex<Option<LastResult>>,
    prices: PriceTable,
}

impl ActionContext {
    pub fn new(prompts: HashMap<String, PromptSpec>, prices: PriceTable) -> Self {
        Self {
            prompts: RwLock::new(prompts),
            last_result: Mutex::new(None),
            prices,
        }
    }

    /// Snapshot of one configured prompt.
    pub fn prompt(&self, id: &str) -> Option<PromptSpec> {
        self.prompts.read().ok().and_then(|map| map.get(id).cloned())
    }

    /// Prompts flagged for inclusion in a fresh matrix column set.
    pub fn matrix_prompts(&self) -> Vec<(String, PromptSpec)> {
        self.prompts
            .read()
            .map(|map| {
                let mut entries: Vec<(String, PromptSpec)> = map
                    .iter()
                    .filter(|(_, p)| p.include_in_matrix)
                    .map(|(id, p)| (id.clone(), p.clone()))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
            })
            .unwrap_or_default()
    }

    /// Swap in an edited prompt set (configuration UI saved).
    pub fn replace_prompts(&self, prompts: HashMap<String, PromptSpec>) {
        if let Ok(mut map) = self.prompts.write() {
            *map = prompts;
        }
    }

    pub fn last_result(&self) -> Option<LastResult> {
        self.last_result.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn set_last_result(&self, result: LastResult) {
        if let Ok(mut guard) = self.last_result.lock() {
            *guard = Some(result);
        }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(name: &str, in_matrix: bool) -> PromptSpec {
        let mut p = PromptSpec::new(name, "gemini-2.5-flash-lite", "do it");
        p.include_in_matrix = in_matrix;
        p
    }

    #[test]
    fn prompt_lookup_returns_clone() {
        let ctx = ActionContext::new(
            HashMap::from([("a".to_string(), prompt("A", false))]),
            PriceTable::default(),
        );
        let snap = ctx.prompt("a").unwrap();
        assert_eq!(snap.name, "A");
        assert!(ctx.prompt("missing").is_none());
    }

    #[test]
    fn matrix_prompts_filters_and_sorts_by_id() {
        let ctx = ActionContext::new(
            HashMap::from([
                ("b".to_string(), prompt("B", true)),
                ("a".to_string(), prompt("A", true)),
                ("c".to_string(), prompt("C", false)),
            ]),
            PriceTable::default(),
        );
        let ids: Vec<String> = ctx.matrix_prompts().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn last_result_starts_empty_and_updates() {
        let ctx = ActionContext::new(HashMap::new(), PriceTable::default());
        assert!(ctx.last_result().is_none());
        ctx.set_last_result(LastResult {
            text: "out".into(),
            prompt: prompt("P", false),
            params: GenerationParams::default(),
        });
        assert_eq!(ctx.last_result().unwrap().text, "out");
    }

    #[test]
    fn replace_prompts_swaps_the_live_set() {
        let ctx = ActionContext::new(
            HashMap::from([("a".to_string(), prompt("A", false))]),
            PriceTable::default(),
        );
        ctx.replace_prompts(HashMap::from([("z".to_string(), prompt("Z", false))]));
        assert!(ctx.prompt("a").is_none());
        assert_eq!(ctx.prompt("z").unwrap().name, "Z");
    }
}
