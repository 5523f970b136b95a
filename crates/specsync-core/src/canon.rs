use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// CanonRule
// ---------------------------------------------------------------------------

/// Deterministic text-to-text cleanup steps, applied in declared order. The
/// composed chain must be idempotent: running it on its own output is a
/// no-op. `Format` delegates to the transform's configured [`Formatter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonRule {
    NormalizeLineEndings,
    TrimTrailingWhitespace,
    SqueezeBlankLines,
    EnsureFinalNewline,
    Format,
}

impl CanonRule {
    pub fn all_text_rules() -> Vec<CanonRule> {
        vec![
            CanonRule::NormalizeLineEndings,
            CanonRule::TrimTrailingWhitespace,
            CanonRule::EnsureFinalNewline,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CanonRule::NormalizeLineEndings => "normalize_line_endings",
            CanonRule::TrimTrailingWhitespace => "trim_trailing_whitespace",
            CanonRule::SqueezeBlankLines => "squeeze_blank_lines",
            CanonRule::EnsureFinalNewline => "ensure_final_newline",
            CanonRule::Format => "format",
        }
    }
}

/// Apply the rule chain in order. The `format` rule requires a formatter;
/// configuring it without one is an error rather than a silent skip.
pub fn canonicalize(
    raw: &str,
    rules: &[CanonRule],
    formatter: Option<&dyn Formatter>,
) -> Result<String> {
    let mut text = raw.to_string();
    for rule in rules {
        text = match rule {
            CanonRule::NormalizeLineEndings => text.replace("\r\n", "\n").replace('\r', "\n"),
            CanonRule::TrimTrailingWhitespace => text
                .split('\n')
                .map(|line| line.trim_end())
                .collect::<Vec<_>>()
                .join("\n"),
            CanonRule::SqueezeBlankLines => squeeze_blank_lines(&text),
            CanonRule::EnsureFinalNewline => {
                if text.is_empty() {
                    text
                } else {
                    let trimmed = text.trim_end_matches('\n');
                    format!("{trimmed}\n")
                }
            }
            CanonRule::Format => match formatter {
                Some(formatter) => formatter.format(&text)?,
                None => {
                    return Err(SyncError::Formatter {
                        name: "format".to_string(),
                        message: "canonicalization rule 'format' configured without a formatter"
                            .to_string(),
                    })
                }
            },
        };
    }
    Ok(text)
}

fn squeeze_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.split('\n') {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}

// ---------------------------------------------------------------------------
// Formatter
// ---------------------------------------------------------------------------

/// How formatter failures are treated. `Required` (the default) fails the
/// run; `Lenient` passes raw text through with a warning and is meant for
/// non-production use only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatterPolicy {
    #[default]
    Required,
    Lenient,
}

/// External-formatter seam. The production implementation shells out; tests
/// inject a deterministic in-process stub so correctness never depends on a
/// particular binary being installed.
pub trait Formatter {
    fn name(&self) -> &str;
    fn format(&self, text: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// CommandFormatter
// ---------------------------------------------------------------------------

/// Runs `program args...` with the raw text on stdin and reads canonical
/// text from stdout. The child is polled and killed after `timeout`; no
/// formatter invocation may block a run indefinitely.
pub struct CommandFormatter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    policy: FormatterPolicy,
}

impl CommandFormatter {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        policy: FormatterPolicy,
    ) -> Self {
        CommandFormatter {
            program: program.into(),
            args,
            timeout,
            policy,
        }
    }

    fn run(&self, text: &str) -> Result<String> {
        if which::which(&self.program).is_err() {
            return Err(SyncError::FormatterMissing(self.program.clone()));
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SyncError::Formatter {
                name: self.program.clone(),
                message: format!("failed to spawn: {e}"),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| SyncError::Formatter {
                    name: self.program.clone(),
                    message: format!("failed to write stdin: {e}"),
                })?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut stdout = String::new();
                    let mut stderr = String::new();
                    if let Some(mut out) = child.stdout.take() {
                        use std::io::Read;
                        out.read_to_string(&mut stdout).ok();
                    }
                    if let Some(mut err) = child.stderr.take() {
                        use std::io::Read;
                        err.read_to_string(&mut stderr).ok();
                    }
                    if !status.success() {
                        let hint: String = stderr.chars().take(500).collect();
                        return Err(SyncError::Formatter {
                            name: self.program.clone(),
                            message: format!("exited with {status}: {hint}"),
                        });
                    }
                    return Ok(stdout);
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        child.kill().ok();
                        child.wait().ok();
                        return Err(SyncError::FormatterTimeout {
                            name: self.program.clone(),
                            seconds: self.timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(SyncError::Formatter {
                        name: self.program.clone(),
                        message: format!("wait failed: {e}"),
                    })
                }
            }
        }
    }
}

impl Formatter for CommandFormatter {
    fn name(&self) -> &str {
        &self.program
    }

    fn format(&self, text: &str) -> Result<String> {
        match self.run(text) {
            Ok(formatted) => Ok(formatted),
            Err(err) => match self.policy {
                FormatterPolicy::Required => Err(err),
                FormatterPolicy::Lenient => {
                    tracing::warn!(
                        formatter = %self.program,
                        error = %err,
                        "formatter failed; passing text through unformatted (lenient policy)"
                    );
                    Ok(text.to_string())
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
