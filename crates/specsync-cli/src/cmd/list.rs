use crate::output::{print_json, print_table};
use anyhow::Context;
use specsync_core::manifest::Manifest;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(root).context("failed to load manifest")?;

    if json {
        let value = serde_json::json!({
            "project": manifest.project.name,
            "transforms": manifest.transforms,
        });
        print_json(&value)?;
        return Ok(());
    }

    if manifest.transforms.is_empty() {
        println!("No transforms defined in the manifest.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = manifest
        .transforms
        .iter()
        .map(|(name, spec)| {
            vec![
                name.clone(),
                spec.inputs
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                spec.output.display().to_string(),
                spec.description.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["NAME", "INPUTS", "OUTPUT", "DESCRIPTION"], rows);
    Ok(())
}
