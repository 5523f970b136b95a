use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// SHA-256 of the given bytes as a lowercase 64-character hex string.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<String> {
    Ok(digest(&std::fs::read(path)?))
}

// ---------------------------------------------------------------------------
// StageStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Receipt
// ---------------------------------------------------------------------------

/// Proof that an artifact was produced deterministically from identified
/// inputs. Created once per successful run, written next to the artifact,
/// never mutated. The four content digests are the idempotence contract;
/// `run_id` and `timestamp` are per-run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(default = "default_version")]
    pub version: u32,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub graph_digest: String,
    pub query_digest: String,
    pub template_digest: String,
    pub output_digest: String,
    pub stages: Vec<StageStatus>,
}

fn default_version() -> u32 {
    1
}

impl Receipt {
    /// Pure function of the four digests plus fresh run metadata.
    pub fn generate(
        graph_digest: String,
        query_digest: String,
        template_digest: String,
        output: &str,
        stages: Vec<StageStatus>,
    ) -> Receipt {
        Receipt {
            version: 1,
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            graph_digest,
            query_digest,
            template_digest,
            output_digest: digest(output.as_bytes()),
            stages,
        }
    }

    /// The receipt file path for a given output artifact.
    pub fn path_for(output: &Path) -> PathBuf {
        let mut name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".receipt.json");
        output.with_file_name(name)
    }

    pub fn load(path: &Path) -> Result<Receipt> {
        if !path.exists() {
            return Err(SyncError::ReceiptNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// True when the stored content digests match freshly computed ones.
    /// Run metadata is deliberately excluded.
    pub fn matches(
        &self,
        graph_digest: &str,
        query_digest: &str,
        template_digest: &str,
        output_digest: &str,
    ) -> bool {
        self.graph_digest == graph_digest
            && self.query_digest == query_digest
            && self.template_digest == template_digest
            && self.output_digest == output_digest
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn digest_is_64_hex_chars_and_stable() {
        let d = digest(b"hello");
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d, digest(b"hello"));
        assert_eq!(
            d,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn digest_is_sensitive_to_single_byte_changes() {
        assert_ne!(digest(b"hello"), digest(b"hello!"));
        assert_ne!(digest(b"hello"), digest(b"Hello"));
    }

    #[test]
    fn receipt_roundtrip() {
        let dir = TempDir::new().unwrap();
        let receipt = Receipt::generate(
            digest(b"graph"),
            digest(b"query"),
            digest(b"template"),
            "Command: hello\n",
            vec![
                StageStatus {
                    stage: "normalize".into(),
                    status: "ok".into(),
                },
                StageStatus {
                    stage: "extract".into(),
                    status: "ok".into(),
                },
            ],
        );
        let path = dir.path().join("out.md.receipt.json");
        receipt.save(&path).unwrap();

        let loaded = Receipt::load(&path).unwrap();
        assert_eq!(loaded, receipt);
        assert_eq!(loaded.stages.len(), 2);
    }

    #[test]
    fn output_digest_covers_final_bytes() {
        let a = Receipt::generate(
            digest(b"g"),
            digest(b"q"),
            digest(b"t"),
            "Command: hello\n",
            vec![],
        );
        let b = Receipt::generate(
            digest(b"g"),
            digest(b"q"),
            digest(b"t"),
            "Command: hello\n",
            vec![],
        );
        // Different runs, identical content digests.
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.output_digest, b.output_digest);
        assert!(a.matches(&b.graph_digest, &b.query_digest, &b.template_digest, &b.output_digest));
    }

    #[test]
    fn receipt_path_is_sibling_of_output() {
        let path = Receipt::path_for(Path::new("docs/commands.md"));
        assert_eq!(path, PathBuf::from("docs/commands.md.receipt.json"));
    }

    #[test]
    fn missing_receipt_is_its_own_error() {
        let err = Receipt::load(Path::new("/nonexistent/r.json")).unwrap_err();
        assert!(matches!(err, SyncError::ReceiptNotFound(_)));
    }
}
