//! The unit abstraction: one node of the dataflow graph.
//!
//! A unit declares the inputs it demands (as [`Slot`](crate::attr::Slot)s),
//! publishes the outputs it owns (as [`AttrHandle`]s), and goes through
//! `initialize` once per device before its first `run`. The graph owns the
//! lifecycle; units only implement the steps.

use std::path::PathBuf;

use rand_chacha::ChaCha8Rng;

use crate::attr::{AttrHandle, Slot};
use crate::backend::Device;
use crate::error::{FlowError, FlowResult};
use crate::graph::Signal;

/// Lifecycle of a unit inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitState {
    #[default]
    Created,
    Initialized,
    /// Opened in the current pass, waiting for its turn.
    Ready,
    Running,
    /// Ran (or was skipped) in the current pass.
    Done,
}

/// Everything a unit may touch while initializing.
pub struct InitContext<'a> {
    pub device: &'a Device,
    signal: &'a Signal,
}

impl<'a> InitContext<'a> {
    pub fn new(device: &'a Device, signal: &'a Signal) -> Self {
        Self { device, signal }
    }

    /// Releases the completion signal once.
    pub fn release(&self) {
        self.signal.release();
    }
}

/// A checkpoint a unit asked for during its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub path: PathBuf,
    /// Move an existing file at `path` to `path.old` before replacing it.
    pub keep_previous: bool,
}

/// Everything a unit may touch while running.
pub struct RunContext<'a> {
    /// The graph-wide random number generator.
    pub rng: &'a mut ChaCha8Rng,
    signal: &'a Signal,
    halt: bool,
    checkpoints: Vec<CheckpointRequest>,
}

impl<'a> RunContext<'a> {
    pub fn new(rng: &'a mut ChaCha8Rng, signal: &'a Signal) -> Self {
        Self {
            rng,
            signal,
            halt: false,
            checkpoints: Vec::new(),
        }
    }

    pub fn release(&self) {
        self.signal.release();
    }

    /// Do not notify successors and end the current run after this unit.
    pub fn halt(&mut self) {
        self.halt = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halt
    }

    /// Asks the graph to write a checkpoint once this unit has finished.
    pub fn request_checkpoint(&mut self, request: CheckpointRequest) {
        self.checkpoints.push(request);
    }

    pub(crate) fn take_checkpoints(&mut self) -> Vec<CheckpointRequest> {
        std::mem::take(&mut self.checkpoints)
    }
}

/// A node of the dataflow graph.
pub trait Unit: Send {
    fn name(&self) -> &str;

    /// Names of demanded inputs that are still unbound.
    fn unbound(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Binds the demanded input `input` to another unit's output.
    fn bind_input(&mut self, input: &str, _source: &AttrHandle) -> FlowResult<()> {
        Err(no_such_input(self.name(), input))
    }

    /// The outputs this unit owns, by name.
    fn outputs(&self) -> Vec<AttrHandle> {
        Vec::new()
    }

    /// Prepares the unit for `ctx.device`. Must be idempotent.
    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> FlowResult<()>;

    /// Performs one pass of work. Blocks until the device has finished and
    /// every output is host-visible.
    fn run(&mut self, ctx: &mut RunContext<'_>) -> FlowResult<()>;

    /// Opaque state stored in checkpoints. `None` if the unit is stateless.
    fn save_state(&self) -> FlowResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn load_state(&mut self, _state: &[u8]) -> FlowResult<()> {
        Ok(())
    }

    /// Called on every unit after a checkpoint has been restored.
    fn resumed(&mut self) {}
}

/// Error for [`Unit::bind_input`] on an input the unit does not have.
pub fn no_such_input(unit: &str, input: &str) -> FlowError {
    FlowError::Graph(format!("unit `{unit}` has no input named `{input}`"))
}

/// Binds `slot` to `source`, checking the attribute type.
pub fn bind_slot<T: Send + Sync + 'static>(
    unit: &str,
    slot: &mut Slot<T>,
    source: &AttrHandle,
) -> FlowResult<()> {
    let typed = source.downcast::<T>().ok_or_else(|| {
        FlowError::Graph(format!(
            "cannot bind `{unit}.{}` ({}) to output `{}` ({})",
            slot.name(),
            std::any::type_name::<T>(),
            source.name,
            source.type_name,
        ))
    })?;
    slot.bind(typed);
    Ok(())
}

/// Names of the slots in `slots` that are unbound.
pub fn unbound_of(slots: &[(&'static str, bool)]) -> Vec<&'static str> {
    slots
        .iter()
        .filter(|(_, bound)| !bound)
        .map(|(name, _)| *name)
        .collect()
}
