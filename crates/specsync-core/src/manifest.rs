use crate::canon::{CanonRule, FormatterPolicy};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "specsync.yaml";

pub fn manifest_path(root: &Path) -> PathBuf {
    root.join(MANIFEST_FILE)
}

// ---------------------------------------------------------------------------
// ManifestWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// FormatterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatterConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_formatter_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub policy: FormatterPolicy,
}

fn default_formatter_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// ProvenanceStyle
// ---------------------------------------------------------------------------

/// Comment style for the generated-file header, e.g. `prefix: "#"` for
/// shell/YAML outputs or `prefix: "<!--"`, `suffix: " -->"` for Markdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceStyle {
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl ProvenanceStyle {
    /// The header line embedded at the top of generated artifacts. Carrying
    /// the source graph digest makes provenance checkable without external
    /// tooling.
    pub fn header(&self, graph_digest: &str) -> String {
        format!(
            "{} generated by specsync from graph {}; do not edit by hand{}\n",
            self.prefix,
            graph_digest,
            self.suffix.as_deref().unwrap_or_default()
        )
    }
}

// ---------------------------------------------------------------------------
// TransformSpec
// ---------------------------------------------------------------------------

/// One named graph-to-artifact transformation. All paths are relative to
/// the project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub shapes: Vec<PathBuf>,
    pub query: PathBuf,
    pub template: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_canonicalize")]
    pub canonicalize: Vec<CanonRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatter: Option<FormatterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ProvenanceStyle>,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: u64,
}

fn default_canonicalize() -> Vec<CanonRule> {
    CanonRule::all_text_rules()
}

fn default_lock_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// ProjectInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Manifest (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectInfo,
    /// Static values exposed to every template render.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    /// BTreeMap so batch sync always walks transforms in name order.
    #[serde(default)]
    pub transforms: BTreeMap<String, TransformSpec>,
}

fn default_version() -> u32 {
    1
}

impl Manifest {
    pub fn new(project_name: impl Into<String>) -> Self {
        Manifest {
            version: 1,
            project: ProjectInfo {
                name: project_name.into(),
                description: None,
            },
            context: BTreeMap::new(),
            transforms: BTreeMap::new(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = manifest_path(root);
        if !path.exists() {
            return Err(SyncError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let manifest: Manifest = serde_yaml::from_str(&data)?;
        Ok(manifest)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = manifest_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn get(&self, name: &str) -> Result<&TransformSpec> {
        self.transforms
            .get(name)
            .ok_or_else(|| SyncError::TransformNotFound(name.to_string()))
    }

    /// Every file referenced by a transform, relative to root. Used by the
    /// watch loop's change detection.
    pub fn referenced_files(&self, spec: &TransformSpec) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Vec::new();
        files.extend(spec.inputs.iter().cloned());
        files.extend(spec.shapes.iter().cloned());
        files.push(spec.query.clone());
        files.push(spec.template.clone());
        files
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self, root: &Path) -> Vec<ManifestWarning> {
        let mut warnings = Vec::new();

        if self.transforms.is_empty() {
            warnings.push(ManifestWarning {
                level: WarnLevel::Warning,
                message: "manifest defines no transforms".to_string(),
            });
        }

        let mut outputs: BTreeMap<&Path, &str> = BTreeMap::new();
        for (name, spec) in &self.transforms {
            if let Some(previous) = outputs.insert(spec.output.as_path(), name) {
                warnings.push(ManifestWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "transforms '{previous}' and '{name}' write the same output {}",
                        spec.output.display()
                    ),
                });
            }

            for file in self.referenced_files(spec) {
                if !root.join(&file).exists() {
                    warnings.push(ManifestWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "transform '{name}' references missing file {}",
                            file.display()
                        ),
                    });
                }
            }

            let wants_format = spec.canonicalize.contains(&CanonRule::Format);
            match (&spec.formatter, wants_format) {
                (None, true) => warnings.push(ManifestWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "transform '{name}' uses the 'format' rule but configures no formatter"
                    ),
                }),
                (Some(_), false) => warnings.push(ManifestWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "transform '{name}' configures a formatter but never runs the 'format' rule"
                    ),
                }),
                _ => {}
            }

            if let Some(formatter) = &spec.formatter {
                if formatter.command.trim().is_empty() {
                    warnings.push(ManifestWarning {
                        level: WarnLevel::Error,
                        message: format!("transform '{name}' has an empty formatter command"),
                    });
                }
                if formatter.timeout_seconds == 0 {
                    warnings.push(ManifestWarning {
                        level: WarnLevel::Warning,
                        message: format!(
                            "transform '{name}' formatter timeout of 0s will always fail"
                        ),
                    });
                }
                if formatter.policy == FormatterPolicy::Lenient {
                    warnings.push(ManifestWarning {
                        level: WarnLevel::Warning,
                        message: format!(
                            "transform '{name}' uses the lenient formatter policy; \
                             output may not be canonical"
                        ),
                    });
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
