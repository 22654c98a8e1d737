use std::collections::BTreeMap;

use log::{info, warn};

use super::{Accelerator, Benchmarker, DeviceProbe, DeviceProfile, ProfileStore};
use crate::backend::{CPU_GUID, Device};
use crate::config::DeviceConfig;
use crate::error::FlowResult;

/// Discovers, rates and selects the device of a run.
///
/// ```text
/// let mut registry = DeviceRegistry::new(config);
/// let profiles = registry.discover(&probe);
/// let profiles = registry.benchmark(profiles)?;
/// let device = registry.select(&profiles);
/// ```
///
/// Ratings live in a [`ProfileStore`] loaded when the registry is created
/// and written back after new measurements, so a device is only measured
/// once.
pub struct DeviceRegistry {
    config: DeviceConfig,
    store: ProfileStore,
    benchmarker: Benchmarker,
    accelerators: Vec<Box<dyn Accelerator>>,
    selected: Vec<String>,
    substitutes: BTreeMap<String, String>,
}

impl DeviceRegistry {
    /// Loads the profile store named by `config`. An unreadable store is
    /// replaced by an empty one.
    pub fn new(config: DeviceConfig) -> Self {
        let store = ProfileStore::load(&config.profile_store).unwrap_or_else(|e| {
            warn!(
                "ignoring unreadable profile store {}: {e}",
                config.profile_store.display()
            );
            ProfileStore::default()
        });
        Self::with_store(config, store)
    }

    pub fn with_store(config: DeviceConfig, store: ProfileStore) -> Self {
        Self {
            benchmarker: Benchmarker::new(config.clone()),
            config,
            store,
            accelerators: Vec::new(),
            selected: Vec::new(),
            substitutes: BTreeMap::new(),
        }
    }

    pub fn with_benchmarker(mut self, benchmarker: Benchmarker) -> Self {
        self.benchmarker = benchmarker;
        self
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    /// Profiles of every accelerator `probe` finds, merged with the stored
    /// ratings. Empty when the configuration asks for the CPU only.
    pub fn discover(&mut self, probe: &dyn DeviceProbe) -> Vec<DeviceProfile> {
        if self.config.cpu_only {
            info!("accelerator discovery disabled");
            self.accelerators.clear();
            return Vec::new();
        }

        self.accelerators = probe.discover();
        let profiles: Vec<DeviceProfile> = self
            .accelerators
            .iter()
            .map(|a| match self.store.get(a.guid()) {
                Some(stored) => DeviceProfile {
                    context: a.context().to_string(),
                    memory_size: a.memory_size(),
                    ..stored.clone()
                },
                None => DeviceProfile::new(a.guid(), a.context(), a.memory_size()),
            })
            .collect();

        for previous in &self.store.previous {
            if !profiles.iter().any(|p| &p.guid == previous) {
                warn!("previously used device {previous} is no longer available");
            }
        }
        profiles
    }

    /// Rates every unrated profile and persists the result.
    ///
    /// A failure to write the store is logged; the ratings are still
    /// returned.
    pub fn benchmark(&mut self, mut profiles: Vec<DeviceProfile>) -> FlowResult<Vec<DeviceProfile>> {
        if profiles.is_empty() {
            return Ok(profiles);
        }
        let tested = self.benchmarker.benchmark(&mut profiles, &self.accelerators)?;
        if tested {
            for profile in &profiles {
                self.store.insert(profile.clone());
            }
            self.persist();
        }
        Ok(profiles)
    }

    /// Picks the device of the run, falling back to the CPU.
    ///
    /// Usable profiles are ranked by rating (then identity); the devices
    /// sharing the execution context of the best one form the selection,
    /// and the first of them that opens becomes the device. Devices the
    /// previous run used but which are no longer selected are retargeted
    /// to the selection, see [`resolve`](Self::resolve).
    pub fn select(&mut self, profiles: &[DeviceProfile]) -> Device {
        let mut ranked: Vec<&DeviceProfile> = profiles.iter().filter(|p| p.is_usable()).collect();
        ranked.sort_by(|a, b| b.rating.total_cmp(&a.rating).then_with(|| a.guid.cmp(&b.guid)));

        let Some(top) = ranked.first() else {
            if !self.config.cpu_only {
                warn!("no usable accelerator, running on the cpu");
            }
            self.retarget(&[]);
            return Device::Cpu;
        };
        let context = top.context.clone();
        let group: Vec<&DeviceProfile> = ranked.into_iter().filter(|p| p.context == context).collect();

        for (i, profile) in group.iter().enumerate() {
            let Some(accelerator) = self.accelerators.iter().find(|a| a.guid() == profile.guid) else {
                continue;
            };
            match accelerator.open() {
                Ok(device) => {
                    info!(
                        "selected {} ({context}, rating {:.3}, block size {})",
                        profile.guid, profile.rating, profile.block_size
                    );
                    let selected: Vec<(String, f64)> =
                        group[i..].iter().map(|p| (p.guid.clone(), p.rating)).collect();
                    self.retarget(&selected);
                    return device;
                }
                Err(e) => warn!("cannot open {}: {e}", profile.guid),
            }
        }

        warn!("no accelerator could be opened, running on the cpu");
        self.retarget(&[]);
        Device::Cpu
    }

    /// Replaces every previously used device that is not in `selected`
    /// (best first, with ratings) by the selected device whose rating is
    /// closest to its stored one, or by the best selected device when its
    /// rating is unknown.
    fn retarget(&mut self, selected: &[(String, f64)]) {
        self.substitutes.clear();
        if let Some((best, _)) = selected.first() {
            let missing = self
                .store
                .previous
                .iter()
                .filter(|p| !selected.iter().any(|(guid, _)| guid == *p));
            for previous in missing {
                let substitute = self
                    .store
                    .get(previous)
                    .filter(|stored| stored.is_rated())
                    .and_then(|stored| {
                        selected
                            .iter()
                            .min_by(|a, b| {
                                (a.1 - stored.rating)
                                    .abs()
                                    .total_cmp(&(b.1 - stored.rating).abs())
                            })
                            .map(|(guid, _)| guid)
                    })
                    .unwrap_or(best);
                warn!("device {previous} is replaced by {substitute}");
                self.substitutes.insert(previous.clone(), substitute.clone());
            }
        }

        self.selected = selected.iter().map(|(guid, _)| guid.clone()).collect();
        if self.store.previous != self.selected && !self.selected.is_empty() {
            self.store.previous = self.selected.clone();
            self.persist();
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.config.profile_store) {
            warn!(
                "cannot write profile store {}: {e}",
                self.config.profile_store.display()
            );
        }
    }

    /// Identities of the selected devices, best first. Empty on the CPU.
    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    /// The device that now stands for `guid`: itself if selected, its
    /// substitute if it was replaced, otherwise the best selected device
    /// (or the CPU).
    pub fn resolve<'a>(&'a self, guid: &'a str) -> &'a str {
        if self.selected.iter().any(|s| s == guid) {
            return guid;
        }
        if let Some(substitute) = self.substitutes.get(guid) {
            return substitute;
        }
        self.selected.first().map_or(CPU_GUID, String::as_str)
    }

    /// Discovers, benchmarks and selects in one go.
    pub fn open(config: DeviceConfig, probe: &dyn DeviceProbe) -> FlowResult<(Self, Device)> {
        let mut registry = Self::new(config);
        let profiles = registry.discover(probe);
        let profiles = registry.benchmark(profiles)?;
        let device = registry.select(&profiles);
        Ok((registry, device))
    }
}
