//! The persisted profile store.
//!
//! A bincode-encoded map from device identity to [`DeviceProfile`], plus the
//! identities of the devices selected by the previous run.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use super::DeviceProfile;
use crate::error::FlowResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileStore {
    pub profiles: BTreeMap<String, DeviceProfile>,
    /// Devices used by the previous run, in selection order.
    pub previous: Vec<String>,
}

impl ProfileStore {
    /// Reads the store at `path`; a missing file is an empty store.
    pub fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no profile store at {}", path.display());
            return Ok(Self::default());
        }
        let file = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(file)?)
    }

    /// Writes the store to `path` through a temporary file.
    pub fn save(&self, path: impl AsRef<Path>) -> FlowResult<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut file, self)?;
            file.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, guid: &str) -> Option<&DeviceProfile> {
        self.profiles.get(guid)
    }

    pub fn insert(&mut self, profile: DeviceProfile) {
        self.profiles.insert(profile.guid.clone(), profile);
    }
}
