use crate::output::{print_json, print_table};
use anyhow::Context;
use specsync_core::manifest::Manifest;
use specsync_core::run::{verify, VerifyStatus};
use std::path::Path;

pub fn run(root: &Path, name: Option<&str>, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(root).context("failed to load manifest")?;

    let selected: Vec<(&str, &specsync_core::manifest::TransformSpec)> = match name {
        Some(name) => vec![(name, manifest.get(name)?)],
        None => manifest
            .transforms
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect(),
    };

    let mut outcomes = Vec::new();
    for (name, spec) in selected {
        let outcome =
            verify(root, name, spec).with_context(|| format!("failed to verify '{name}'"))?;
        outcomes.push(outcome);
    }

    if json {
        print_json(&serde_json::json!({ "transforms": outcomes }))?;
    } else {
        let rows: Vec<Vec<String>> = outcomes
            .iter()
            .map(|o| {
                let status = match o.status {
                    VerifyStatus::Ok => "ok",
                    VerifyStatus::Stale => "stale",
                    VerifyStatus::MissingOutput => "missing output",
                    VerifyStatus::MissingReceipt => "missing receipt",
                };
                vec![o.name.clone(), status.to_string(), o.mismatches.join(",")]
            })
            .collect();
        print_table(&["NAME", "STATUS", "CHANGED DIGESTS"], rows);
    }

    let stale = outcomes
        .iter()
        .filter(|o| o.status != VerifyStatus::Ok)
        .count();
    if stale > 0 {
        anyhow::bail!("{stale} transform(s) out of sync; run 'specsync sync'");
    }
    Ok(())
}
