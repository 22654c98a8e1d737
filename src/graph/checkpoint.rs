//! Checkpoint files.
//!
//! # `.bfck` Format
//!
//! ```text
//! ┌────────────┬─────────────┬──────────────────────────────┐
//! │ "bfck"[4]  │ u8: version │ bincode(Checkpoint)          │
//! └────────────┴─────────────┴──────────────────────────────┘
//! ```
//!
//! The payload holds the opaque state of every stateful unit (keyed by
//! position and name, so a checkpoint only loads into the same graph), the
//! exact position of the graph's random number generator, the pass counter
//! and the device the run was using.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};

const BFCK_MAGIC: &[u8; 4] = b"bfck";
const BFCK_VERSION: u8 = 1;

/// Position of a ChaCha generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: [u8; 32],
    pub stream: u64,
    pub word_pos: u128,
}

/// Snapshot of a whole graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Passes executed by the graph when the snapshot was taken.
    pub passes: u64,
    /// `("index:name", state)` of every unit that has state.
    pub units: Vec<(String, Vec<u8>)>,
    pub rng: RngState,
    /// Identity of the device the run was using.
    pub device: Option<String>,
}

impl Checkpoint {
    pub fn unit_key(index: usize, name: &str) -> String {
        format!("{index}:{name}")
    }

    /// Writes the checkpoint to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> FlowResult<()> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(BFCK_MAGIC)?;
        file.write_all(&[BFCK_VERSION])?;
        bincode::serialize_into(&mut file, self)?;
        file.flush()?;
        Ok(())
    }

    /// Writes to a temporary file next to `path` and renames it into place.
    /// With `keep_previous`, an existing file is first moved to `path.old`.
    pub fn save_atomic(&self, path: impl AsRef<Path>, keep_previous: bool) -> FlowResult<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        self.save(&tmp)?;
        if keep_previous && path.exists() {
            std::fs::rename(path, path.with_extension("old"))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reads and validates a checkpoint file.
    pub fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let mut file = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != BFCK_MAGIC {
            return Err(FlowError::Checkpoint("invalid magic header".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != BFCK_VERSION {
            return Err(FlowError::Checkpoint(format!(
                "unsupported version {} (expected {BFCK_VERSION})",
                version[0]
            )));
        }

        let checkpoint: Checkpoint = bincode::deserialize_from(&mut file)?;
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    fn validate(&self) -> FlowResult<()> {
        let mut keys: Vec<&str> = self.units.iter().map(|(k, _)| k.as_str()).collect();
        keys.sort_unstable();
        if keys.windows(2).any(|w| w[0] == w[1]) {
            return Err(FlowError::Checkpoint("duplicate unit entries".into()));
        }
        Ok(())
    }

    pub fn unit_state(&self, key: &str) -> Option<&[u8]> {
        self.units
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, state)| state.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            passes: 12,
            units: vec![(Checkpoint::unit_key(3, "end"), vec![1, 2, 3])],
            rng: RngState {
                seed: [7; 32],
                stream: 0,
                word_pos: 40,
            },
            device: Some("cpu".into()),
        }
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.bfck");
        sample().save(&path).unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap(), sample());
    }

    #[test]
    fn atomic_save_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.bfck");
        sample().save_atomic(&path, true).unwrap();
        let mut newer = sample();
        newer.passes = 20;
        newer.save_atomic(&path, true).unwrap();

        assert_eq!(Checkpoint::load(&path).unwrap().passes, 20);
        assert_eq!(Checkpoint::load(path.with_extension("old")).unwrap().passes, 12);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bpat");
        std::fs::write(&path, b"bpat\x01rest").unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(FlowError::Checkpoint(_))));
    }
}
