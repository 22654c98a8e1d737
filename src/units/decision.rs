use log::info;
use serde::{Deserialize, Serialize};

use crate::attr::{Attr, AttrHandle, Slot};
use crate::error::FlowResult;
use crate::unit::{InitContext, RunContext, Unit, bind_slot, no_such_input, unbound_of};

/// When a [`Decision`] declares the run complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Epochs in a row without a new best error count.
    pub fail_iterations: u64,
    /// Total epochs, if limited.
    pub max_epochs: Option<u64>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            fail_iterations: 100,
            max_epochs: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DecisionState {
    accumulated: u64,
    epoch_number: u64,
    epoch_n_err: u64,
    best_n_err: u64,
    since_best: u64,
    complete: bool,
}

/// Accumulates the per-batch error count of an evaluator over an epoch.
///
/// Demands `epoch_ended` (from a loader) and `minibatch_n_err` (from an
/// evaluator). At the end of every epoch it publishes the epoch's error
/// count, whether it `improved` on the best so far, and whether the run is
/// `complete`.
pub struct Decision {
    name: String,
    config: DecisionConfig,
    pub epoch_ended: Slot<bool>,
    pub minibatch_n_err: Slot<u32>,
    pub complete: Attr<bool>,
    pub improved: Attr<bool>,
    pub epoch_number: Attr<u64>,
    pub epoch_n_err: Attr<u64>,
    pub best_n_err: Attr<u64>,
    accumulated: u64,
    since_best: u64,
}

impl Decision {
    pub fn new(name: impl Into<String>, config: DecisionConfig) -> Self {
        Self {
            name: name.into(),
            config,
            epoch_ended: Slot::new("epoch_ended"),
            minibatch_n_err: Slot::new("minibatch_n_err"),
            complete: Attr::new(false),
            improved: Attr::new(false),
            epoch_number: Attr::new(0),
            epoch_n_err: Attr::new(0),
            best_n_err: Attr::new(u64::MAX),
            accumulated: 0,
            since_best: 0,
        }
    }

    fn end_epoch(&mut self) {
        let n_err = std::mem::take(&mut self.accumulated);
        let epoch = {
            let mut epoch = self.epoch_number.write();
            *epoch += 1;
            *epoch
        };
        self.epoch_n_err.set(n_err);

        if n_err < self.best_n_err.get() {
            self.best_n_err.set(n_err);
            self.improved.set(true);
            self.since_best = 0;
        } else {
            self.since_best += 1;
        }

        let stalled = self.since_best >= self.config.fail_iterations;
        let exhausted = self.config.max_epochs.is_some_and(|max| epoch >= max);
        if stalled || exhausted {
            self.complete.set(true);
        }
        info!(
            "{}: epoch {epoch} n_err {n_err} (best {}){}",
            self.name,
            self.best_n_err.get(),
            if self.complete.get() { ", complete" } else { "" }
        );
    }
}

impl Unit for Decision {
    fn name(&self) -> &str {
        &self.name
    }

    fn unbound(&self) -> Vec<&'static str> {
        unbound_of(&[
            ("epoch_ended", self.epoch_ended.is_bound()),
            ("minibatch_n_err", self.minibatch_n_err.is_bound()),
        ])
    }

    fn bind_input(&mut self, input: &str, source: &AttrHandle) -> FlowResult<()> {
        match input {
            "epoch_ended" => bind_slot(&self.name, &mut self.epoch_ended, source),
            "minibatch_n_err" => bind_slot(&self.name, &mut self.minibatch_n_err, source),
            _ => Err(no_such_input(&self.name, input)),
        }
    }

    fn outputs(&self) -> Vec<AttrHandle> {
        vec![
            self.complete.handle("complete"),
            self.improved.handle("improved"),
            self.epoch_number.handle("epoch_number"),
            self.epoch_n_err.handle("epoch_n_err"),
            self.best_n_err.handle("best_n_err"),
        ]
    }

    fn initialize(&mut self, _ctx: &mut InitContext<'_>) -> FlowResult<()> {
        Ok(())
    }

    fn run(&mut self, _ctx: &mut RunContext<'_>) -> FlowResult<()> {
        self.improved.set(false);
        self.accumulated += u64::from(self.minibatch_n_err.get(&self.name)?.get());
        if self.epoch_ended.get(&self.name)?.get() {
            self.end_epoch();
        }
        Ok(())
    }

    fn save_state(&self) -> FlowResult<Option<Vec<u8>>> {
        let state = DecisionState {
            accumulated: self.accumulated,
            epoch_number: self.epoch_number.get(),
            epoch_n_err: self.epoch_n_err.get(),
            best_n_err: self.best_n_err.get(),
            since_best: self.since_best,
            complete: self.complete.get(),
        };
        Ok(Some(bincode::serialize(&state)?))
    }

    fn load_state(&mut self, state: &[u8]) -> FlowResult<()> {
        let state: DecisionState = bincode::deserialize(state)?;
        self.accumulated = state.accumulated;
        self.since_best = state.since_best;
        self.epoch_number.set(state.epoch_number);
        self.epoch_n_err.set(state.epoch_n_err);
        self.best_n_err.set(state.best_n_err);
        self.complete.set(state.complete);
        Ok(())
    }

    /// Lets a resumed run continue past the point where it stopped.
    fn resumed(&mut self) {
        self.complete.set(false);
        self.since_best = 0;
        if let Some(max) = self.config.max_epochs.as_mut() {
            *max += self.epoch_number.get();
        }
    }
}
