use crate::canon::{canonicalize, CommandFormatter, Formatter};
use crate::error::{Result, SyncError};
use crate::graph::{Graph, GraphSource};
use crate::io;
use crate::lock::PathLock;
use crate::manifest::TransformSpec;
use crate::query::Query;
use crate::receipt::{digest, Receipt, StageStatus};
use crate::shape::ShapeSet;
use crate::template::{StaticContext, Template};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Extract,
    Emit,
    Canonicalize,
    Receipt,
}

impl Stage {
    pub fn all() -> &'static [Stage] {
        &[
            Stage::Normalize,
            Stage::Extract,
            Stage::Emit,
            Stage::Canonicalize,
            Stage::Receipt,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Extract => "extract",
            Stage::Emit => "emit",
            Stage::Canonicalize => "canonicalize",
            Stage::Receipt => "receipt",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

/// A pipeline failure: which stage broke and why. The run terminates; there
/// is no retry and no partial-success state.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {error}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub error: SyncError,
}

// ---------------------------------------------------------------------------
// RunOptions / RunOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Perform every stage except the final artifact/receipt writes.
    pub dry_run: bool,
    /// Checked between stages; cancellation lands at stage boundaries.
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub name: String,
    pub output_path: PathBuf,
    pub receipt: Receipt,
    pub rows: usize,
    /// False when the canonical output is byte-identical to what was
    /// already on disk.
    pub changed: bool,
    /// False for dry runs.
    pub wrote: bool,
}

// ---------------------------------------------------------------------------
// TransformRun
// ---------------------------------------------------------------------------

/// One end-to-end execution for one (graph, query, template) triple. The
/// run borrows its spec and context; it owns nothing but the receipt it
/// produces.
pub struct TransformRun<'a> {
    root: &'a Path,
    name: &'a str,
    spec: &'a TransformSpec,
    context: &'a StaticContext,
    options: RunOptions,
}

impl<'a> TransformRun<'a> {
    pub fn new(
        root: &'a Path,
        name: &'a str,
        spec: &'a TransformSpec,
        context: &'a StaticContext,
    ) -> Self {
        TransformRun {
            root,
            name,
            spec,
            context,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    fn check_cancel(&self, stage: Stage) -> Result<()> {
        if let Some(flag) = &self.options.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(SyncError::Cancelled {
                    stage: stage.as_str(),
                });
            }
        }
        Ok(())
    }

    fn at<T>(stage: Stage, result: Result<T>) -> std::result::Result<T, StageError> {
        result.map_err(|error| StageError { stage, error })
    }

    /// Run the full pipeline. Every stage is a pure function of its inputs;
    /// the only side effects are the lock-guarded artifact and receipt
    /// writes at the end.
    pub fn execute(&self) -> std::result::Result<RunOutcome, StageError> {
        let mut stages = Vec::with_capacity(Stage::all().len());

        // Normalize: parse + merge sources, validate against shapes.
        Self::at(Stage::Normalize, self.check_cancel(Stage::Normalize))?;
        let graph = Self::at(Stage::Normalize, self.normalize())?;
        let graph_digest = digest(graph.canonical_ntriples().as_bytes());
        tracing::debug!(transform = self.name, triples = graph.len(), "normalized");
        stages.push(ok_status(Stage::Normalize));

        // Extract: run the query against the normalized graph.
        Self::at(Stage::Extract, self.check_cancel(Stage::Extract))?;
        let query_text = Self::at(Stage::Extract, self.read_input(&self.spec.query))?;
        let query_digest = digest(query_text.as_bytes());
        let query = Self::at(Stage::Extract, Query::parse(&query_text))?;
        let rows = Self::at(Stage::Extract, query.execute(&graph))?;
        tracing::debug!(transform = self.name, rows = rows.len(), "extracted");
        stages.push(ok_status(Stage::Extract));

        // Emit: render the template over the extracted rows.
        Self::at(Stage::Emit, self.check_cancel(Stage::Emit))?;
        let template_text = Self::at(Stage::Emit, self.read_input(&self.spec.template))?;
        let template_digest = digest(template_text.as_bytes());
        let template = Self::at(Stage::Emit, Template::parse(&template_text))?;
        let mut raw = Self::at(Stage::Emit, template.render(&rows, self.context))?;
        if let Some(provenance) = &self.spec.provenance {
            raw.insert_str(0, &provenance.header(&graph_digest));
        }
        tracing::debug!(transform = self.name, bytes = raw.len(), "emitted");
        stages.push(ok_status(Stage::Emit));

        // Canonicalize + receipt + write share the output-path critical
        // section; the lock covers all three so concurrent runs cannot
        // interleave their writes.
        Self::at(Stage::Canonicalize, self.check_cancel(Stage::Canonicalize))?;
        let output_path = self.root.join(&self.spec.output);
        let _lock = Self::at(
            Stage::Canonicalize,
            PathLock::acquire(
                &output_path,
                Duration::from_secs(self.spec.lock_timeout_seconds),
            ),
        )?;

        let formatter = self.formatter();
        let canonical = Self::at(
            Stage::Canonicalize,
            canonicalize(&raw, &self.spec.canonicalize, formatter.as_deref()),
        )?;
        tracing::debug!(transform = self.name, bytes = canonical.len(), "canonicalized");
        stages.push(ok_status(Stage::Canonicalize));

        Self::at(Stage::Receipt, self.check_cancel(Stage::Receipt))?;
        stages.push(ok_status(Stage::Receipt));
        let receipt = Receipt::generate(
            graph_digest,
            query_digest,
            template_digest,
            &canonical,
            stages,
        );

        let existing = std::fs::read_to_string(&output_path).ok();
        let changed = existing.as_deref() != Some(canonical.as_str());

        if !self.options.dry_run {
            Self::at(
                Stage::Receipt,
                io::atomic_write(&output_path, canonical.as_bytes()),
            )?;
            Self::at(
                Stage::Receipt,
                receipt.save(&Receipt::path_for(&output_path)),
            )?;
        }

        tracing::debug!(
            transform = self.name,
            output = %output_path.display(),
            changed,
            dry_run = self.options.dry_run,
            "run complete"
        );

        Ok(RunOutcome {
            name: self.name.to_string(),
            output_path,
            receipt,
            rows: rows.len(),
            changed,
            wrote: !self.options.dry_run,
        })
    }

    fn normalize(&self) -> Result<Graph> {
        let mut sources = Vec::with_capacity(self.spec.inputs.len());
        for input in &self.spec.inputs {
            sources.push(GraphSource::from_file(&self.root.join(input))?);
        }
        let graph = Graph::parse(&sources)?;

        let shape_paths: Vec<PathBuf> =
            self.spec.shapes.iter().map(|s| self.root.join(s)).collect();
        if !shape_paths.is_empty() {
            let shapes = ShapeSet::load(&shape_paths)?;
            let violations = shapes.validate(&graph);
            if !violations.is_empty() {
                return Err(SyncError::Validation(violations));
            }
        }
        Ok(graph)
    }

    fn read_input(&self, path: &Path) -> Result<String> {
        let full = self.root.join(path);
        if !full.exists() {
            return Err(SyncError::SourceNotFound(full.display().to_string()));
        }
        Ok(std::fs::read_to_string(full)?)
    }

    fn formatter(&self) -> Option<Box<dyn Formatter>> {
        self.spec.formatter.as_ref().map(|config| {
            Box::new(CommandFormatter::new(
                config.command.clone(),
                config.args.clone(),
                Duration::from_secs(config.timeout_seconds),
                config.policy,
            )) as Box<dyn Formatter>
        })
    }
}

fn ok_status(stage: Stage) -> StageStatus {
    StageStatus {
        stage: stage.as_str().to_string(),
        status: "ok".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    /// Receipt digests match the current inputs and output.
    Ok,
    /// At least one digest moved; the artifact needs a re-sync.
    Stale,
    MissingOutput,
    MissingReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub name: String,
    pub status: VerifyStatus,
    /// Which digests moved: graph, query, template, output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<String>,
}

/// Compare a transform's stored receipt against freshly computed digests of
/// its current inputs and output. Cheap: no extraction or rendering runs.
pub fn verify(root: &Path, name: &str, spec: &TransformSpec) -> Result<VerifyOutcome> {
    let output_path = root.join(&spec.output);
    if !output_path.exists() {
        return Ok(VerifyOutcome {
            name: name.to_string(),
            status: VerifyStatus::MissingOutput,
            mismatches: Vec::new(),
        });
    }
    let receipt = match Receipt::load(&Receipt::path_for(&output_path)) {
        Ok(receipt) => receipt,
        Err(SyncError::ReceiptNotFound(_)) => {
            return Ok(VerifyOutcome {
                name: name.to_string(),
                status: VerifyStatus::MissingReceipt,
                mismatches: Vec::new(),
            })
        }
        Err(e) => return Err(e),
    };

    let mut sources = Vec::with_capacity(spec.inputs.len());
    for input in &spec.inputs {
        sources.push(GraphSource::from_file(&root.join(input))?);
    }
    let graph = Graph::parse(&sources)?;
    let graph_digest = digest(graph.canonical_ntriples().as_bytes());
    let query_digest = crate::receipt::digest_file(&root.join(&spec.query))?;
    let template_digest = crate::receipt::digest_file(&root.join(&spec.template))?;
    let output_digest = crate::receipt::digest_file(&output_path)?;

    let mut mismatches = Vec::new();
    for (label, stored, current) in [
        ("graph", &receipt.graph_digest, &graph_digest),
        ("query", &receipt.query_digest, &query_digest),
        ("template", &receipt.template_digest, &template_digest),
        ("output", &receipt.output_digest, &output_digest),
    ] {
        if stored != current {
            mismatches.push(label.to_string());
        }
    }

    Ok(VerifyOutcome {
        name: name.to_string(),
        status: if mismatches.is_empty() {
            VerifyStatus::Ok
        } else {
            VerifyStatus::Stale
        },
        mismatches,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::CanonRule;
    use tempfile::TempDir;

    const TTL: &str = "@prefix ex: <http://example.org/> .\n\
        ex:cmd1 a ex:Command ; ex:label \"hello\" .\n";

    const QUERY: &str = "PREFIX ex: <http://example.org/>\n\
        SELECT ?label WHERE {\n\
          ?cmd a ex:Command .\n\
          ?cmd ex:label ?label .\n\
        } ORDER BY ?label\n";

    const TEMPLATE: &str = "{% for cmd in rows %}Command: {{ cmd.label }}{% endfor %}";

    const SHAPES: &str = r#"shapes:
  - target_class: "http://example.org/Command"
    properties:
      - path: "http://example.org/label"
        min_count: 1
        max_count: 1
        datatype: string
"#;

    fn setup(dir: &Path) -> TransformSpec {
        std::fs::write(dir.join("spec.ttl"), TTL).unwrap();
        std::fs::write(dir.join("query.rq"), QUERY).unwrap();
        std::fs::write(dir.join("template.tera"), TEMPLATE).unwrap();
        std::fs::write(dir.join("shapes.yaml"), SHAPES).unwrap();
        TransformSpec {
            description: None,
            inputs: vec![PathBuf::from("spec.ttl")],
            shapes: vec![PathBuf::from("shapes.yaml")],
            query: PathBuf::from("query.rq"),
            template: PathBuf::from("template.tera"),
            output: PathBuf::from("docs/commands.md"),
            canonicalize: CanonRule::all_text_rules(),
            formatter: None,
            provenance: None,
            lock_timeout_seconds: 5,
        }
    }

    fn context() -> StaticContext {
        StaticContext::new()
    }

    #[test]
    fn end_to_end_produces_expected_output_and_receipt() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();

        let outcome = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap();

        let output = std::fs::read_to_string(dir.path().join("docs/commands.md")).unwrap();
        assert_eq!(output, "Command: hello\n");
        assert_eq!(outcome.rows, 1);
        assert!(outcome.changed);
        assert!(outcome.wrote);

        let receipt = Receipt::load(&Receipt::path_for(&outcome.output_path)).unwrap();
        for d in [
            &receipt.graph_digest,
            &receipt.query_digest,
            &receipt.template_digest,
            &receipt.output_digest,
        ] {
            assert_eq!(d.len(), 64);
            assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        }
        assert_eq!(receipt.stages.len(), 5);
        assert!(receipt.stages.iter().all(|s| s.status == "ok"));
    }

    #[test]
    fn rerun_on_unchanged_input_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();

        let first = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap();
        let bytes_first = std::fs::read(dir.path().join("docs/commands.md")).unwrap();

        let second = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap();
        let bytes_second = std::fs::read(dir.path().join("docs/commands.md")).unwrap();

        assert_eq!(bytes_first, bytes_second);
        assert_eq!(
            first.receipt.output_digest,
            second.receipt.output_digest
        );
        assert_eq!(first.receipt.graph_digest, second.receipt.graph_digest);
        assert!(!second.changed, "second run should detect no change");
    }

    #[test]
    fn digest_sensitivity_per_input() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();
        let base = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap()
            .receipt;

        // Change one triple: graph digest and output digest move, the
        // query and template digests do not.
        std::fs::write(
            dir.path().join("spec.ttl"),
            "@prefix ex: <http://example.org/> .\n\
             ex:cmd1 a ex:Command ; ex:label \"changed\" .\n",
        )
        .unwrap();
        let after_graph = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap()
            .receipt;
        assert_ne!(after_graph.graph_digest, base.graph_digest);
        assert_ne!(after_graph.output_digest, base.output_digest);
        assert_eq!(after_graph.query_digest, base.query_digest);
        assert_eq!(after_graph.template_digest, base.template_digest);

        // Change one character of the query text only.
        std::fs::write(dir.path().join("query.rq"), format!("{QUERY}# x\n")).unwrap();
        let after_query = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap()
            .receipt;
        assert_ne!(after_query.query_digest, after_graph.query_digest);
        assert_eq!(after_query.graph_digest, after_graph.graph_digest);

        // Change one character of the template.
        std::fs::write(
            dir.path().join("template.tera"),
            TEMPLATE.replace("Command:", "Command!"),
        )
        .unwrap();
        let after_template = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap()
            .receipt;
        assert_ne!(
            after_template.template_digest,
            after_query.template_digest
        );
        assert_ne!(after_template.output_digest, after_query.output_digest);
    }

    #[test]
    fn shape_violations_fail_the_normalize_stage_with_all_violations() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();
        std::fs::write(
            dir.path().join("spec.ttl"),
            "@prefix ex: <http://example.org/> .\n\
             ex:a a ex:Command .\n\
             ex:b a ex:Command .\n",
        )
        .unwrap();

        let err = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap_err();
        assert_eq!(err.stage, Stage::Normalize);
        match err.error {
            SyncError::Validation(violations) => assert_eq!(violations.len(), 2),
            other => panic!("expected Validation, got {other}"),
        }
        assert!(!dir.path().join("docs/commands.md").exists());
    }

    #[test]
    fn undefined_template_variable_fails_emit_and_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();
        std::fs::write(
            dir.path().join("template.tera"),
            "{% for cmd in rows %}{{ cmd.description }}{% endfor %}",
        )
        .unwrap();

        let err = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap_err();
        assert_eq!(err.stage, Stage::Emit);
        match err.error {
            SyncError::UndefinedVariable { variable, .. } => {
                assert_eq!(variable, "cmd.description")
            }
            other => panic!("expected UndefinedVariable, got {other}"),
        }
        assert!(!dir.path().join("docs/commands.md").exists());
        assert!(!Receipt::path_for(&dir.path().join("docs/commands.md")).exists());
    }

    #[test]
    fn malformed_query_fails_extract_stage() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();
        std::fs::write(dir.path().join("query.rq"), "SELECT WHERE oops").unwrap();

        let err = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap_err();
        assert_eq!(err.stage, Stage::Extract);
    }

    #[test]
    fn empty_input_set_is_a_valid_empty_graph() {
        let dir = TempDir::new().unwrap();
        let mut spec = setup(dir.path());
        spec.inputs = vec![];
        spec.shapes = vec![];
        let ctx = context();

        let outcome = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap();
        assert_eq!(outcome.rows, 0);
        let output = std::fs::read_to_string(dir.path().join("docs/commands.md")).unwrap();
        assert_eq!(output, "");
    }

    #[test]
    fn dry_run_performs_all_stages_but_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();

        let outcome = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .with_options(RunOptions {
                dry_run: true,
                cancel: None,
            })
            .execute()
            .unwrap();
        assert!(outcome.changed);
        assert!(!outcome.wrote);
        assert!(!dir.path().join("docs/commands.md").exists());
        assert_eq!(outcome.receipt.output_digest.len(), 64);
    }

    #[test]
    fn cancellation_lands_at_stage_boundary() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();
        let cancel = Arc::new(AtomicBool::new(true));

        let err = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .with_options(RunOptions {
                dry_run: false,
                cancel: Some(cancel),
            })
            .execute()
            .unwrap_err();
        assert_eq!(err.stage, Stage::Normalize);
        assert!(matches!(err.error, SyncError::Cancelled { .. }));
    }

    #[test]
    fn provenance_header_is_embedded_and_digested() {
        let dir = TempDir::new().unwrap();
        let mut spec = setup(dir.path());
        spec.provenance = Some(crate::manifest::ProvenanceStyle {
            prefix: "<!--".into(),
            suffix: Some(" -->".into()),
        });
        let ctx = context();

        let outcome = TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap();
        let output = std::fs::read_to_string(&outcome.output_path).unwrap();
        assert!(output.starts_with("<!-- generated by specsync from graph "));
        assert!(output.contains(&outcome.receipt.graph_digest));
        assert_eq!(
            outcome.receipt.output_digest,
            digest(output.as_bytes()),
            "output digest must cover the provenance header"
        );
    }

    #[test]
    fn verify_reports_ok_then_stale_after_edit() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());
        let ctx = context();
        TransformRun::new(dir.path(), "commands", &spec, &ctx)
            .execute()
            .unwrap();

        let outcome = verify(dir.path(), "commands", &spec).unwrap();
        assert_eq!(outcome.status, VerifyStatus::Ok);

        // Hand-edit the generated artifact: verify must flag it.
        std::fs::write(dir.path().join("docs/commands.md"), "tampered\n").unwrap();
        let outcome = verify(dir.path(), "commands", &spec).unwrap();
        assert_eq!(outcome.status, VerifyStatus::Stale);
        assert_eq!(outcome.mismatches, vec!["output".to_string()]);
    }

    #[test]
    fn verify_missing_receipt_and_output() {
        let dir = TempDir::new().unwrap();
        let spec = setup(dir.path());

        let outcome = verify(dir.path(), "commands", &spec).unwrap();
        assert_eq!(outcome.status, VerifyStatus::MissingOutput);

        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/commands.md"), "orphan\n").unwrap();
        let outcome = verify(dir.path(), "commands", &spec).unwrap();
        assert_eq!(outcome.status, VerifyStatus::MissingReceipt);
    }

    #[test]
    fn stage_names_are_stable() {
        let names: Vec<&str> = Stage::all().iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec!["normalize", "extract", "emit", "canonicalize", "receipt"]
        );
    }
}
