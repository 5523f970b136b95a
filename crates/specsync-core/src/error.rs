use crate::shape::Violation;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not initialized: run 'specsync init'")]
    NotInitialized,

    #[error("transform not found: {0}")]
    TransformNotFound(String),

    #[error("input source not found: {0}")]
    SourceNotFound(String),

    #[error("{source_name}:{line}: graph syntax error: {message}")]
    GraphParse {
        source_name: String,
        line: usize,
        message: String,
    },

    #[error("{}", format_violations(.0))]
    Validation(Vec<Violation>),

    #[error("invalid shape definition in {file}: {message}")]
    ShapeDefinition { file: String, message: String },

    #[error("query syntax error at line {line}: {message}")]
    QueryParse { line: usize, message: String },

    #[error("template syntax error at line {line}: {message}")]
    TemplateParse { line: usize, message: String },

    #[error("undefined variable '{variable}' at template line {line}")]
    UndefinedVariable { variable: String, line: usize },

    #[error("unbound variable '{variable}' at template line {line}: add a default(...) filter or guard with {{% if %}}")]
    UnboundVariable { variable: String, line: usize },

    #[error("filter '{filter}' at template line {line}: {message}")]
    Filter {
        filter: String,
        line: usize,
        message: String,
    },

    #[error("template render error at line {line}: {message}")]
    Render { line: usize, message: String },

    #[error("formatter '{name}' failed: {message}")]
    Formatter { name: String, message: String },

    #[error("formatter '{name}' timed out after {seconds}s")]
    FormatterTimeout { name: String, seconds: u64 },

    #[error("formatter '{0}' not found on PATH")]
    FormatterMissing(String),

    #[error("could not lock {path} within {seconds}s{}", held_by(.pid))]
    LockTimeout {
        path: String,
        seconds: u64,
        pid: Option<u32>,
    },

    #[error("run cancelled before {stage} stage")]
    Cancelled { stage: &'static str },

    #[error("receipt not found: {0}")]
    ReceiptNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn format_violations(violations: &[Violation]) -> String {
    let mut out = format!("{} shape violation(s):", violations.len());
    for v in violations {
        out.push_str(&format!("\n  {} {}: {}", v.node, v.path, v.message));
    }
    out
}

fn held_by(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (held by pid {pid})"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
