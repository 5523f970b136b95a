use crate::output::print_json;
use anyhow::Context;
use specsync_core::manifest::{Manifest, WarnLevel};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(root).context("failed to load manifest")?;
    let warnings = manifest.validate(root);

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Manifest is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    let has_errors = warnings.iter().any(|w| w.level == WarnLevel::Error);
    if has_errors {
        anyhow::bail!("manifest validation found errors");
    }
    Ok(())
}
