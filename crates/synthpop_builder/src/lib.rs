//! Synthpop Builder Library
//!
//! File-facing side of the synthetic population engine:
//! CSV tables → [`synthpop_core`] stages → MessagePack → LZ4 snapshots with
//! SHA256 checksums, so a long pipeline can resume from its last good stage.

pub mod ingest;
pub mod pipeline;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use synthpop_core::{Agent, Household, Scorecard};

pub use ingest::{ParseStats, TableSource};
pub use pipeline::{Pipeline, PipelineFile, Stage};

/// Everything a stage reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationState {
    pub agents: Vec<Agent>,
    pub households: Vec<Household>,
    pub scorecard: Scorecard,
}

/// Population state as persisted after one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub version: u32,
    pub stage: String,
    pub state: PopulationState,
}

/// Snapshot sidecar, stored as JSON next to the compressed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u32,
    pub stage: String,
    /// SHA256 of the compressed payload (hex)
    pub checksum: String,
    /// RFC3339
    pub created_at: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
}

/// Whether [`SnapshotStore::perform_stage`] ran the stage or reused a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum StageStatus {
    Loaded,
    Computed(SnapshotMetadata),
}

/// Versioned snapshots under one directory, named `{prefix}_v{version}`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    prefix: String,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
        }
    }

    pub fn data_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("{}_v{}.msgpack.lz4", self.prefix, version))
    }

    pub fn metadata_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("{}_v{}.meta.json", self.prefix, version))
    }

    /// Serialize, compress and checksum a snapshot, then write payload and sidecar.
    ///
    /// # Returns
    ///
    /// Metadata of the written snapshot
    pub fn save(&self, snapshot: &StageSnapshot) -> Result<SnapshotMetadata> {
        // 1. MessagePack
        let msgpack_bytes =
            rmp_serde::to_vec(snapshot).context("Failed to serialize snapshot to MessagePack")?;
        let original_size = msgpack_bytes.len() as u64;

        // 2. LZ4 (size prepended)
        let compressed = lz4_flex::compress_prepend_size(&msgpack_bytes);
        let compressed_size = compressed.len() as u64;

        // 3. Checksum
        let checksum = sha256_hex(&compressed);

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create snapshot directory: {}", self.dir.display()))?;
        let data_path = self.data_path(snapshot.version);
        fs::write(&data_path, &compressed)
            .with_context(|| format!("Failed to write snapshot: {}", data_path.display()))?;

        let metadata = SnapshotMetadata {
            version: snapshot.version,
            stage: snapshot.stage.clone(),
            checksum,
            created_at: chrono::Utc::now().to_rfc3339(),
            original_size,
            compressed_size,
            compression_ratio: if original_size > 0 {
                compressed_size as f64 / original_size as f64
            } else {
                0.0
            },
        };
        let metadata_path = self.metadata_path(snapshot.version);
        let metadata_json = serde_json::to_string_pretty(&metadata)?;
        fs::write(&metadata_path, metadata_json)
            .with_context(|| format!("Failed to write metadata: {}", metadata_path.display()))?;

        Ok(metadata)
    }

    pub fn read_metadata(&self, version: u32) -> Result<SnapshotMetadata> {
        let path = self.metadata_path(version);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Failed to parse metadata: {}", path.display()))
    }

    /// Whether a snapshot exists for `version` and matches its recorded checksum.
    pub fn verify(&self, version: u32) -> Result<bool> {
        if !self.data_path(version).exists() || !self.metadata_path(version).exists() {
            return Ok(false);
        }
        let metadata = self.read_metadata(version)?;
        verify_snapshot(&self.data_path(version), &metadata.checksum)
    }

    /// Load a verified snapshot.
    ///
    /// # Returns
    ///
    /// `None` when no snapshot exists for `version` or its checksum does not match
    pub fn load(&self, version: u32) -> Result<Option<StageSnapshot>> {
        if !self.data_path(version).exists() {
            return Ok(None);
        }
        if !self.verify(version)? {
            eprintln!(
                "Warning: snapshot {} failed checksum verification, discarding",
                self.data_path(version).display()
            );
            return Ok(None);
        }
        load_snapshot(&self.data_path(version)).map(Some)
    }

    /// Reuse the stored output of stage `version` if there is a good one,
    /// otherwise run the stage on `state` and store its output.
    ///
    /// # Arguments
    ///
    /// * `version` - Stage number within the pipeline
    /// * `stage` - Stage label, recorded in the snapshot
    /// * `state` - Input state; replaced by the stage output
    /// * `run` - The stage itself
    pub fn perform_stage<F>(
        &self,
        version: u32,
        stage: &str,
        state: &mut PopulationState,
        run: F,
    ) -> Result<StageStatus>
    where
        F: FnOnce(&mut PopulationState) -> Result<()>,
    {
        if let Some(snapshot) = self.load(version)? {
            if snapshot.stage == stage {
                *state = snapshot.state;
                return Ok(StageStatus::Loaded);
            }
            eprintln!(
                "Warning: snapshot v{} holds stage '{}', expected '{}', recomputing",
                version, snapshot.stage, stage
            );
        }

        run(state)?;
        let snapshot = StageSnapshot {
            version,
            stage: stage.to_string(),
            state: state.clone(),
        };
        let metadata = self.save(&snapshot)?;
        Ok(StageStatus::Computed(metadata))
    }
}

/// Check a snapshot payload against an expected SHA256 checksum
pub fn verify_snapshot(path: &Path, expected_checksum: &str) -> Result<bool> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    Ok(sha256_hex(&bytes) == expected_checksum)
}

/// Decompress and decode a snapshot payload (no checksum check)
pub fn load_snapshot(path: &Path) -> Result<StageSnapshot> {
    let compressed = fs::read(path).with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    let msgpack_bytes =
        lz4_flex::decompress_size_prepended(&compressed).context("Failed to decompress LZ4")?;
    rmp_serde::from_slice(&msgpack_bytes).context("Failed to deserialize snapshot from MessagePack")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Human-readable byte size formatting
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use synthpop_core::{instantiate, Unit};
    use tempfile::TempDir;

    fn state() -> PopulationState {
        let mut agents = instantiate("neighb_code", &[("BU01".to_string(), 50)]);
        for (i, agent) in agents.iter_mut().enumerate() {
            agent
                .set_attribute("gender", (if i % 2 == 0 { "male" } else { "female" }).to_string())
                .unwrap();
        }
        PopulationState {
            agents,
            ..PopulationState::default()
        }
    }

    #[test]
    fn test_save_verify_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SnapshotStore::new(dir.path(), "city");
        let snapshot = StageSnapshot {
            version: 1,
            stage: "assign gender".to_string(),
            state: state(),
        };

        let metadata = store.save(&snapshot)?;
        assert_eq!(metadata.version, 1);
        assert!(metadata.compressed_size < metadata.original_size);
        assert!(store.verify(1)?);
        assert_eq!(store.read_metadata(1)?, metadata);
        assert_eq!(store.load(1)?, Some(snapshot));
        assert_eq!(store.load(2)?, None);
        Ok(())
    }

    #[test]
    fn test_perform_stage_resumes() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SnapshotStore::new(dir.path(), "city");
        let runs = Cell::new(0);
        let stage = |state: &mut PopulationState| {
            runs.set(runs.get() + 1);
            *state = self::state();
            Ok(())
        };

        let mut first = PopulationState::default();
        let status = store.perform_stage(1, "instantiate", &mut first, stage)?;
        assert!(matches!(status, StageStatus::Computed(_)));

        let mut second = PopulationState::default();
        let status = store.perform_stage(1, "instantiate", &mut second, stage)?;
        assert_eq!(status, StageStatus::Loaded);
        assert_eq!(runs.get(), 1);
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_corrupted_snapshot_is_recomputed() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SnapshotStore::new(dir.path(), "city");
        let mut state = self::state();
        store.perform_stage(1, "instantiate", &mut state, |_| Ok(()))?;

        let mut bytes = fs::read(store.data_path(1))?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(store.data_path(1), bytes)?;
        assert!(!store.verify(1)?);
        assert_eq!(store.load(1)?, None);

        let mut recomputed = PopulationState::default();
        let status = store.perform_stage(1, "instantiate", &mut recomputed, |s| {
            *s = self::state();
            Ok(())
        })?;
        assert!(matches!(status, StageStatus::Computed(_)));
        assert!(store.verify(1)?);
        Ok(())
    }

    #[test]
    fn test_stage_name_mismatch_recomputes() -> Result<()> {
        let dir = TempDir::new()?;
        let store = SnapshotStore::new(dir.path(), "city");
        let mut state = self::state();
        store.perform_stage(1, "assign gender", &mut state, |_| Ok(()))?;

        let mut other = PopulationState::default();
        let status = store.perform_stage(1, "assign age", &mut other, |_| Ok(()))?;
        assert!(matches!(status, StageStatus::Computed(_)));
        assert_eq!(store.read_metadata(1)?.stage, "assign age");
        Ok(())
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0.00 B");
        assert_eq!(human_bytes(1536), "1.50 KB");
        assert_eq!(human_bytes(1024 * 1024), "1.00 MB");
    }
}
