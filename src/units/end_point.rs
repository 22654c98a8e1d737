use std::path::PathBuf;

use log::info;

use crate::attr::{Attr, AttrHandle, Slot};
use crate::config::CompletionConfig;
use crate::error::FlowResult;
use crate::unit::{CheckpointRequest, InitContext, RunContext, Unit, bind_slot, no_such_input};

/// The completion node of a graph.
///
/// Counts passes (`session_passes` for this process, `total_passes` across
/// checkpoints), asks for checkpoints, and releases the completion signal
/// once the session budget is spent or the bound `completed` flag is set.
/// Releasing also halts the run.
///
/// Checkpoints are only written when `snapshot_dir` is configured:
///
/// - every `snapshot_frequency` total passes, as `{name}_{total}.bfck`;
/// - when the bound `improved` flag is set and at least
///   `improvement_warmup` total passes have run, as `{name}_best.bfck`
///   (the previous best is kept as `{name}_best.old`).
///
/// A `max_passes` of 0 never ends the session on its own.
pub struct EndPoint {
    name: String,
    config: CompletionConfig,
    pub completed: Slot<bool>,
    pub improved: Slot<bool>,
    pub session_passes: Attr<u64>,
    pub total_passes: Attr<u64>,
    announced: bool,
}

impl EndPoint {
    pub fn new(name: impl Into<String>, config: CompletionConfig) -> Self {
        Self {
            name: name.into(),
            config,
            completed: Slot::new("completed"),
            improved: Slot::new("improved"),
            session_passes: Attr::new(0),
            total_passes: Attr::new(0),
            announced: false,
        }
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    fn snapshot_path(&self, suffix: &str) -> Option<PathBuf> {
        self.config
            .snapshot_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_{suffix}.bfck", self.name)))
    }

    fn flag(slot: &Slot<bool>) -> bool {
        slot.source().is_some_and(|flag| flag.get())
    }
}

impl Unit for EndPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_input(&mut self, input: &str, source: &AttrHandle) -> FlowResult<()> {
        match input {
            "completed" => bind_slot(&self.name, &mut self.completed, source),
            "improved" => bind_slot(&self.name, &mut self.improved, source),
            _ => Err(no_such_input(&self.name, input)),
        }
    }

    fn outputs(&self) -> Vec<AttrHandle> {
        vec![
            self.session_passes.handle("session_passes"),
            self.total_passes.handle("total_passes"),
        ]
    }

    /// Releases the completion signal the first time it is called.
    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> FlowResult<()> {
        if !self.announced {
            self.announced = true;
            ctx.release();
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> FlowResult<()> {
        let session = {
            let mut session = self.session_passes.write();
            *session += 1;
            *session
        };
        let total = {
            let mut total = self.total_passes.write();
            *total += 1;
            *total
        };

        let frequency = self.config.snapshot_frequency;
        if frequency > 0 && total % frequency == 0 {
            if let Some(path) = self.snapshot_path(&total.to_string()) {
                ctx.request_checkpoint(CheckpointRequest {
                    path,
                    keep_previous: false,
                });
            }
        }
        if Self::flag(&self.improved) && total >= self.config.improvement_warmup {
            if let Some(path) = self.snapshot_path("best") {
                ctx.request_checkpoint(CheckpointRequest {
                    path,
                    keep_previous: true,
                });
            }
        }

        let exhausted = self.config.max_passes > 0 && session >= self.config.max_passes;
        let completed = Self::flag(&self.completed);
        if exhausted || completed {
            info!(
                "{}: {} after {session} passes ({total} in total)",
                self.name,
                if completed { "completed" } else { "session budget spent" }
            );
            ctx.release();
            ctx.halt();
        }
        Ok(())
    }

    fn save_state(&self) -> FlowResult<Option<Vec<u8>>> {
        Ok(Some(bincode::serialize(&self.total_passes.get())?))
    }

    fn load_state(&mut self, state: &[u8]) -> FlowResult<()> {
        self.total_passes.set(bincode::deserialize(state)?);
        Ok(())
    }

    /// A resumed run is a new session.
    fn resumed(&mut self) {
        self.session_passes.set(0);
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::backend::Device;
    use crate::graph::Signal;

    fn config(max_passes: u64) -> CompletionConfig {
        CompletionConfig {
            max_passes,
            snapshot_frequency: 2,
            snapshot_dir: Some(PathBuf::from("snapshots")),
            improvement_warmup: 0,
        }
    }

    #[test]
    fn initialize_releases_once() {
        let signal = Signal::new();
        let mut end = EndPoint::new("end", config(3));
        end.initialize(&mut InitContext::new(&Device::Cpu, &signal)).unwrap();
        end.initialize(&mut InitContext::new(&Device::Cpu, &signal)).unwrap();
        assert_eq!(signal.available(), 1);
    }

    #[test]
    fn halts_on_session_budget_and_requests_snapshots() {
        let signal = Signal::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut end = EndPoint::new("end", config(3));

        for pass in 1..=3u64 {
            let mut ctx = RunContext::new(&mut rng, &signal);
            end.run(&mut ctx).unwrap();
            assert_eq!(ctx.is_halted(), pass == 3);
            let requests = ctx.take_checkpoints();
            assert_eq!(requests.len(), usize::from(pass % 2 == 0));
            if let Some(request) = requests.first() {
                assert_eq!(request.path, PathBuf::from("snapshots/end_2.bfck"));
            }
        }
        assert_eq!(signal.available(), 1);
        assert_eq!(end.total_passes.get(), 3);
    }

    #[test]
    fn improvement_requests_best_snapshot() {
        let signal = Signal::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let improved = Attr::new(true);
        let mut end = EndPoint::new("end", config(0));
        end.bind_input("improved", &improved.handle("improved")).unwrap();

        let mut ctx = RunContext::new(&mut rng, &signal);
        end.run(&mut ctx).unwrap();
        let requests = ctx.take_checkpoints();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].keep_previous);
        assert!(requests[0].path.ends_with("end_best.bfck"));
        assert!(!ctx.is_halted());
    }
}
