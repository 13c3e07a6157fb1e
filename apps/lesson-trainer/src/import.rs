//! JSON item import.

use chrono::Utc;
use review_engine::{Database, DrillType, Item};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct ImportItem {
    pub prompt: String,
    pub answer: String,
    pub language: String,
    /// Defaults to every staged drill.
    #[serde(default)]
    pub drills: Vec<DrillType>,
}

/// Import every item in `path` for `learner` in one transaction. Returns how many were added.
pub fn import_file(db: &Database, learner: &str, path: &Path) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let items: Vec<ImportItem> = serde_json::from_str(&content)?;
    let now = Utc::now();

    let batch: Vec<(Item, Vec<DrillType>)> = items
        .into_iter()
        .map(|entry| {
            let drills = if entry.drills.is_empty() {
                DrillType::STAGES.to_vec()
            } else {
                entry.drills
            };
            (Item::new(learner, &entry.prompt, &entry.answer, &entry.language), drills)
        })
        .collect();
    let count = db.insert_items(&batch, now)?;
    tracing::info!(learner, count, path = %path.display(), "imported items");
    Ok(count)
}
