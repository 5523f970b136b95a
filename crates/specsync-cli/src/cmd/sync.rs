use crate::output::print_json;
use anyhow::Context;
use specsync_core::manifest::Manifest;
use specsync_core::run::{RunOptions, TransformRun};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

pub fn run(
    root: &Path,
    name: Option<&str>,
    dry_run: bool,
    watch: bool,
    interval_secs: u64,
    json: bool,
) -> anyhow::Result<()> {
    sync_once(root, name, dry_run, json)?;

    if watch {
        let name = name.map(String::from);
        eprintln!("watching for changes (poll every {interval_secs}s, ctrl-c to stop)");
        specsync_core::watch::watch(
            root,
            Duration::from_secs(interval_secs),
            Arc::new(AtomicBool::new(false)),
            |changed| {
                for path in changed {
                    eprintln!("changed: {}", path.display());
                }
                // A sync failure in watch mode is reported and the loop
                // keeps running; the next edit gets another chance.
                if let Err(e) = sync_once(root, name.as_deref(), dry_run, json) {
                    eprintln!("error: {e:#}");
                }
            },
        )
        .context("watch loop failed")?;
    }
    Ok(())
}

fn sync_once(root: &Path, name: Option<&str>, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(root).context("failed to load manifest")?;

    let selected: Vec<(&str, &specsync_core::manifest::TransformSpec)> = match name {
        Some(name) => vec![(name, manifest.get(name)?)],
        // BTreeMap iteration: batch order is name order, deterministic.
        None => manifest
            .transforms
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect(),
    };

    let mut results = Vec::new();
    let mut failures = 0usize;
    for (name, spec) in selected {
        let run = TransformRun::new(root, name, spec, &manifest.context).with_options(RunOptions {
            dry_run,
            cancel: None,
        });
        match run.execute() {
            Ok(outcome) => results.push(outcome),
            Err(e) => {
                failures += 1;
                eprintln!("{name}: {e}");
                if let specsync_core::SyncError::Validation(violations) = &e.error {
                    for v in violations {
                        eprintln!("  violation: {} {} ({}): {}", v.node, v.path, v.constraint, v.message);
                    }
                }
            }
        }
    }

    if json {
        let value = serde_json::json!({
            "dry_run": dry_run,
            "synced": results.iter().map(|o| {
                serde_json::json!({
                    "name": o.name,
                    "output": o.output_path.display().to_string(),
                    "rows": o.rows,
                    "changed": o.changed,
                    "wrote": o.wrote,
                    "output_digest": o.receipt.output_digest,
                })
            }).collect::<Vec<_>>(),
            "failures": failures,
        });
        print_json(&value)?;
    } else {
        for o in &results {
            let marker = match (dry_run, o.changed) {
                (true, true) => "would update",
                (true, false) => "up to date",
                (false, true) => "updated",
                (false, false) => "unchanged",
            };
            println!(
                "{}: {} {} ({} row(s), {})",
                o.name,
                marker,
                o.output_path.display(),
                o.rows,
                &o.receipt.output_digest[..12]
            );
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} transform(s) failed");
    }
    Ok(())
}
