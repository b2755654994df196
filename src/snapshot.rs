use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::case::{CaseOutputs, ReferenceCase};
use crate::compare::Tolerance;
use crate::errors::{GruError, Result};

/// Current snapshot format version
/// Increment this when making breaking changes to the serialization format
const SNAPSHOT_VERSION: u32 = 1;

/// A reference case together with the results it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenCase {
    pub case: ReferenceCase,
    pub outputs: CaseOutputs,
}

/// Encoding of [`VersionedSnapshot::data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotFormat {
    Json,
    Binary,
}

impl SnapshotFormat {
    /// `.json` files hold JSON payloads, everything else bincode
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => SnapshotFormat::Json,
            _ => SnapshotFormat::Binary,
        }
    }
}

/// Versioned golden-case container with integrity checking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedSnapshot {
    /// Format version for backward compatibility
    pub version: u32,
    /// SHA256 checksum of the serialized case (hex string)
    pub checksum: String,
    pub format: SnapshotFormat,
    pub data: Vec<u8>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Timestamp when the snapshot was saved (ISO 8601 format)
    pub saved_at: String,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub bidirectional: bool,
    pub seq_len: usize,
    pub batch_n: usize,
    pub num_parameters: usize,
    pub description: Option<String>,
}

fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

impl VersionedSnapshot {
    /// # Errors
    /// Returns `GruError::Serialization` if encoding fails
    pub fn from_golden(
        golden: &GoldenCase,
        format: SnapshotFormat,
        description: Option<String>,
    ) -> Result<Self> {
        let data = match format {
            SnapshotFormat::Json => {
                serde_json::to_vec_pretty(golden).map_err(|e| GruError::Serialization {
                    source: Box::new(e),
                })?
            }
            SnapshotFormat::Binary => {
                let config = bincode::config::standard();
                bincode::serde::encode_to_vec(golden, config).map_err(|e| {
                    GruError::Serialization {
                        source: Box::new(e),
                    }
                })?
            }
        };

        let case = &golden.case;
        let metadata = SnapshotMetadata {
            saved_at: chrono::Utc::now().to_rfc3339(),
            hidden_size: case.config.hidden_size,
            num_layers: case.config.num_layers,
            bidirectional: case.config.direction.is_bidirectional(),
            seq_len: case.profile.seq_len(),
            batch_n: case.profile.total(),
            num_parameters: case.weights.len(),
            description,
        };

        Ok(Self {
            version: SNAPSHOT_VERSION,
            checksum: checksum(&data),
            format,
            data,
            metadata,
        })
    }

    /// # Errors
    /// Returns `GruError::Serialization` if checksum validation fails
    pub fn validate_checksum(&self) -> Result<()> {
        let computed = checksum(&self.data);
        if computed != self.checksum {
            return Err(GruError::Serialization {
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "Checksum mismatch: expected {}, got {}",
                        self.checksum, computed
                    ),
                )),
            });
        }
        Ok(())
    }

    /// # Errors
    /// Returns `GruError::Serialization` if the version is newer than supported
    pub fn validate_version(&self) -> Result<()> {
        if self.version > SNAPSHOT_VERSION {
            return Err(GruError::Serialization {
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "Snapshot version {} is newer than supported version {}",
                        self.version, SNAPSHOT_VERSION
                    ),
                )),
            });
        }
        if self.version < SNAPSHOT_VERSION {
            tracing::warn!(
                "Loading snapshot with older version {} (current: {})",
                self.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(())
    }

    /// Validates version and checksum, then decodes the golden case
    pub fn to_golden(&self) -> Result<GoldenCase> {
        self.validate_version()?;
        self.validate_checksum()?;

        let golden = match self.format {
            SnapshotFormat::Json => {
                serde_json::from_slice(&self.data).map_err(|e| GruError::Serialization {
                    source: Box::new(e),
                })?
            }
            SnapshotFormat::Binary => {
                let config = bincode::config::standard();
                let (golden, _): (GoldenCase, usize) =
                    bincode::serde::decode_from_slice(&self.data, config).map_err(|e| {
                        GruError::Serialization {
                            source: Box::new(e),
                        }
                    })?;
                golden
            }
        };
        Ok(golden)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| GruError::Serialization {
            source: Box::new(e),
        })?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| GruError::Serialization {
            source: Box::new(e),
        })
    }
}

impl GoldenCase {
    /// Runs `case` through the reference passes and records the results
    pub fn record(case: ReferenceCase) -> Result<Self> {
        let outputs = case.run()?;
        Ok(Self { case, outputs })
    }

    /// Saves with versioning; the file extension picks the payload format
    pub fn save(&self, path: &Path, description: Option<String>) -> Result<()> {
        let snapshot =
            VersionedSnapshot::from_golden(self, SnapshotFormat::from_path(path), description)?;
        snapshot.save_to_file(path)?;

        tracing::info!(
            path = %path.display(),
            version = SNAPSHOT_VERSION,
            checksum = &snapshot.checksum[..16],
            "Golden case saved with versioning and integrity check"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let snapshot = VersionedSnapshot::load_from_file(path)?;
        tracing::info!(
            path = %path.display(),
            version = snapshot.version,
            "Loading golden case saved at {}",
            snapshot.metadata.saved_at
        );
        snapshot.to_golden()
    }

    /// Re-runs the stored case and compares every result buffer
    pub fn verify(&self, tolerance: Tolerance) -> Result<f64> {
        let fresh = self.case.run()?;
        fresh.verify_against(&self.outputs, tolerance)
    }
}

/// Loads a snapshot and checks that the reference still reproduces it
pub fn verify_snapshot(path: &Path, tolerance: Tolerance) -> Result<f64> {
    let golden = GoldenCase::load(path)?;
    let error = golden.verify(tolerance)?;
    tracing::info!(path = %path.display(), error, "Golden case reproduced");
    Ok(error)
}
