//! The dependency graph scheduler.
//!
//! Units live in an arena and are referred to by [`UnitId`]. Two kinds of
//! control links connect them:
//!
//! - a *forward* link (`link_from`): the unit opens in a pass once every
//!   forward predecessor has finished in that pass;
//! - a *repeat* link (`repeat_from`): when the predecessor finishes, the unit
//!   is scheduled as the entry of the next pass. This is the only way to
//!   close a loop; forward links must stay acyclic.
//!
//! Data links are made by binding a unit's demanded input to another unit's
//! output ([`Graph::bind`]) or by sharing attributes directly before the
//! units are added.
//!
//! Each unit has two gates. When `gate_block` holds, the unit neither runs
//! nor notifies its successors. When `gate_skip` holds, the unit does not
//! run but its successors are notified as if it had.
//!
//! A run ends when the end node halts (see
//! [`EndPoint`](crate::units::EndPoint)) or when no repeat link fired in the
//! last pass.

pub mod checkpoint;
pub mod gate;
pub mod workflow;

pub use checkpoint::{Checkpoint, RngState};
pub use gate::{Gate, NumRef};
pub use workflow::{Signal, Workflow};

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::attr::AttrRef;
use crate::backend::Device;
use crate::error::{FlowError, FlowResult};
use crate::unit::{InitContext, RunContext, Unit, UnitState};
use crate::units::Repeater;

/// Index of a unit in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(usize);

impl UnitId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Forward,
    Repeat,
}

struct Node {
    unit: Box<dyn Unit>,
    state: UnitState,
    preds: Vec<(UnitId, LinkKind)>,
    succs: Vec<(UnitId, LinkKind)>,
    gate_block: Gate,
    gate_skip: Gate,
}

/// `unit`'s input `input` reads an output of `source`.
struct DataLink {
    unit: UnitId,
    input: String,
    source: UnitId,
}

impl Node {
    fn forward_preds(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.preds
            .iter()
            .filter(|(_, kind)| *kind == LinkKind::Forward)
            .map(|(id, _)| *id)
    }
}

/// Outcome of [`Graph::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Passes started by this run.
    pub passes: u64,
    /// Whether the end node stopped the run (as opposed to the graph
    /// running out of repeat links).
    pub halted: bool,
}

pub struct Graph {
    nodes: Vec<Node>,
    data_links: Vec<DataLink>,
    start: UnitId,
    end: Option<UnitId>,
    rng: ChaCha8Rng,
    signal: Arc<Signal>,
    device: Option<Device>,
    passes: u64,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// A graph holding only its start node (a [`Repeater`]).
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u64) -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            data_links: Vec::new(),
            start: UnitId(0),
            end: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            signal: Arc::new(Signal::new()),
            device: None,
            passes: 0,
        };
        graph.start = graph.add(Repeater::new("start"));
        graph
    }

    pub fn start(&self) -> UnitId {
        self.start
    }

    pub fn end(&self) -> Option<UnitId> {
        self.end
    }

    pub fn add(&mut self, unit: impl Unit + 'static) -> UnitId {
        self.add_boxed(Box::new(unit))
    }

    pub fn add_boxed(&mut self, unit: Box<dyn Unit>) -> UnitId {
        self.nodes.push(Node {
            unit,
            state: UnitState::Created,
            preds: Vec::new(),
            succs: Vec::new(),
            gate_block: Gate::Closed,
            gate_skip: Gate::Closed,
        });
        UnitId(self.nodes.len() - 1)
    }

    /// `unit` runs after `pred` in the same pass.
    pub fn link_from(&mut self, unit: UnitId, pred: UnitId) -> FlowResult<()> {
        self.link(unit, pred, LinkKind::Forward)
    }

    /// `unit` starts the next pass once `pred` has finished.
    pub fn repeat_from(&mut self, unit: UnitId, pred: UnitId) -> FlowResult<()> {
        self.link(unit, pred, LinkKind::Repeat)
    }

    fn link(&mut self, unit: UnitId, pred: UnitId, kind: LinkKind) -> FlowResult<()> {
        self.check(unit)?;
        self.check(pred)?;
        if unit == pred && kind == LinkKind::Forward {
            return Err(FlowError::Graph(format!(
                "`{}` cannot follow itself in the same pass",
                self.nodes[unit.0].unit.name()
            )));
        }
        if self.nodes[unit.0].preds.contains(&(pred, kind)) {
            return Err(FlowError::Graph(format!(
                "duplicate link {} -> {}",
                self.nodes[pred.0].unit.name(),
                self.nodes[unit.0].unit.name()
            )));
        }
        self.nodes[unit.0].preds.push((pred, kind));
        self.nodes[pred.0].succs.push((unit, kind));
        Ok(())
    }

    /// Designates the completion node.
    pub fn set_end(&mut self, unit: UnitId) -> FlowResult<()> {
        self.check(unit)?;
        self.end = Some(unit);
        Ok(())
    }

    /// While `gate` holds, `unit` does not run and does not notify successors.
    pub fn gate_block(&mut self, unit: UnitId, gate: Gate) -> FlowResult<()> {
        self.check(unit)?;
        self.nodes[unit.0].gate_block = gate;
        Ok(())
    }

    /// While `gate` holds, `unit` does not run but successors are notified.
    pub fn gate_skip(&mut self, unit: UnitId, gate: Gate) -> FlowResult<()> {
        self.check(unit)?;
        self.nodes[unit.0].gate_skip = gate;
        Ok(())
    }

    /// Binds input `input` of `unit` to output `output` of `source`.
    ///
    /// `source` must run before `unit` in every pass, i.e. be reachable
    /// backwards from `unit` over forward links; [`initialize`](Self::initialize)
    /// rejects the graph otherwise.
    pub fn bind(&mut self, unit: UnitId, input: &str, source: UnitId, output: &str) -> FlowResult<()> {
        self.check(unit)?;
        let handle = self.handle(source, output)?;
        self.nodes[unit.0].unit.bind_input(input, &handle)?;
        self.data_links.retain(|l| !(l.unit == unit && l.input == input));
        self.data_links.push(DataLink {
            unit,
            input: input.to_string(),
            source,
        });
        Ok(())
    }

    /// A read-only reference to output `output` of `source`.
    pub fn output<T: Send + Sync + 'static>(&self, source: UnitId, output: &str) -> FlowResult<AttrRef<T>> {
        let handle = self.handle(source, output)?;
        handle.downcast::<T>().ok_or_else(|| {
            FlowError::Graph(format!(
                "output `{output}` is a {}, not a {}",
                handle.type_name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// A gate that holds while boolean output `output` of `source` is true.
    pub fn flag(&self, source: UnitId, output: &str) -> FlowResult<Gate> {
        Ok(Gate::Flag(self.output::<bool>(source, output)?))
    }

    fn handle(&self, source: UnitId, output: &str) -> FlowResult<crate::attr::AttrHandle> {
        self.check(source)?;
        let unit = &self.nodes[source.0].unit;
        unit.outputs()
            .into_iter()
            .find(|h| h.name == output)
            .ok_or_else(|| FlowError::Graph(format!("unit `{}` has no output `{output}`", unit.name())))
    }

    fn check(&self, unit: UnitId) -> FlowResult<()> {
        if unit.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(FlowError::Graph(format!("unknown unit {}", unit.0)))
        }
    }

    pub fn name(&self, unit: UnitId) -> Option<&str> {
        self.nodes.get(unit.0).map(|n| n.unit.name())
    }

    pub fn state(&self, unit: UnitId) -> Option<UnitState> {
        self.nodes.get(unit.0).map(|n| n.state)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Passes executed since the graph was built (or restored).
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn signal(&self) -> Arc<Signal> {
        Arc::clone(&self.signal)
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Unit indices in forward-link order, or an error naming a unit on a
    /// forward cycle.
    fn topological_order(&self) -> FlowResult<Vec<usize>> {
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.forward_preds().count()).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for (succ, kind) in &self.nodes[i].succs {
                if *kind == LinkKind::Forward {
                    pending[succ.0] -= 1;
                    if pending[succ.0] == 0 {
                        queue.push_back(succ.0);
                    }
                }
            }
        }

        match (0..self.nodes.len()).find(|&i| pending[i] > 0) {
            Some(i) => Err(FlowError::Graph(format!(
                "forward links form a cycle through `{}`; close loops with a repeat link",
                self.nodes[i].unit.name()
            ))),
            None => Ok(order),
        }
    }

    /// Whether `ancestor` finishes before `unit` opens in every pass.
    fn runs_before(&self, ancestor: UnitId, unit: UnitId) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<UnitId> = self.nodes[unit.0].forward_preds().collect();
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return true;
            }
            if !std::mem::replace(&mut seen[id.0], true) {
                stack.extend(self.nodes[id.0].forward_preds());
            }
        }
        false
    }

    fn check_data_links(&self) -> FlowResult<()> {
        for link in &self.data_links {
            if !self.runs_before(link.source, link.unit) {
                return Err(FlowError::Graph(format!(
                    "`{}.{}` reads an output of `{}`, which does not run before it in the pass",
                    self.nodes[link.unit.0].unit.name(),
                    link.input,
                    self.nodes[link.source.0].unit.name()
                )));
            }
        }
        Ok(())
    }

    /// Checks the wiring and initializes every unit on `device`.
    ///
    /// Every demanded input of every unit is checked before any unit is
    /// initialized. Units are initialized upstream first, so a unit can size
    /// its buffers from its inputs. Calling it again with an unchanged graph
    /// is harmless. Every input bound with [`bind`](Self::bind) must read a
    /// unit that runs earlier in the same pass.
    pub fn initialize(&mut self, device: &Device) -> FlowResult<()> {
        if self.end.is_none() {
            return Err(FlowError::Graph("the graph has no end node".into()));
        }
        for node in &self.nodes {
            if let Some(attr) = node.unit.unbound().first() {
                return Err(FlowError::Configuration {
                    unit: node.unit.name().to_string(),
                    attr: attr.to_string(),
                });
            }
        }
        let order = self.topological_order()?;
        self.check_data_links()?;

        info!("initializing {} units on {:?}", self.nodes.len(), device);
        for i in order {
            let node = &mut self.nodes[i];
            let mut ctx = InitContext::new(device, &self.signal);
            node.unit
                .initialize(&mut ctx)
                .map_err(|e| wrap(node.unit.name(), e))?;
            node.state = UnitState::Initialized;
        }
        self.device = Some(device.clone());
        Ok(())
    }

    /// Executes passes until the end node halts or no repeat link fires.
    pub fn run(&mut self) -> FlowResult<RunSummary> {
        if self.device.is_none() {
            return Err(FlowError::Graph("run called before initialize".into()));
        }

        let mut summary = RunSummary {
            passes: 0,
            halted: false,
        };
        let mut entry = vec![self.start];

        while !entry.is_empty() {
            self.passes += 1;
            summary.passes += 1;
            debug!("pass {} starts at {:?}", self.passes, entry);

            let (halted, next) = self.pass(entry)?;
            if halted {
                summary.halted = true;
                break;
            }
            entry = next;
        }

        for node in &mut self.nodes {
            node.state = UnitState::Initialized;
        }
        Ok(summary)
    }

    /// One pass. Returns whether the run was halted and the entries of the
    /// next pass.
    fn pass(&mut self, entry: Vec<UnitId>) -> FlowResult<(bool, Vec<UnitId>)> {
        let n = self.nodes.len();
        let mut fired = vec![false; n];
        let mut next = Vec::new();
        for node in &mut self.nodes {
            node.state = UnitState::Initialized;
        }

        let mut queue: VecDeque<UnitId> = VecDeque::new();
        for id in entry {
            if self.nodes[id.0].state != UnitState::Ready {
                self.nodes[id.0].state = UnitState::Ready;
                queue.push_back(id);
            }
        }

        while let Some(id) = queue.pop_front() {
            let (notify, halted) = self.visit(id)?;
            if halted {
                return Ok((true, next));
            }
            if !notify {
                continue;
            }
            fired[id.0] = true;

            for (succ, kind) in self.nodes[id.0].succs.clone() {
                match kind {
                    LinkKind::Repeat => {
                        if !next.contains(&succ) {
                            next.push(succ);
                        }
                    }
                    LinkKind::Forward => {
                        let node = &mut self.nodes[succ.0];
                        if node.state == UnitState::Initialized
                            && node.forward_preds().all(|p| fired[p.0])
                        {
                            node.state = UnitState::Ready;
                            queue.push_back(succ);
                        }
                    }
                }
            }
        }

        Ok((false, next))
    }

    /// Evaluates the gates of `id` and runs it. Returns whether successors
    /// are notified and whether the unit halted the run.
    fn visit(&mut self, id: UnitId) -> FlowResult<(bool, bool)> {
        let node = &mut self.nodes[id.0];
        if node.gate_block.evaluate() {
            debug!("{}: blocked", node.unit.name());
            node.state = UnitState::Done;
            return Ok((false, false));
        }
        if node.gate_skip.evaluate() {
            debug!("{}: skipped", node.unit.name());
            node.state = UnitState::Done;
            return Ok((true, false));
        }

        node.state = UnitState::Running;
        let mut ctx = RunContext::new(&mut self.rng, &self.signal);
        node.unit.run(&mut ctx).map_err(|e| wrap(node.unit.name(), e))?;
        node.state = UnitState::Done;

        let halted = ctx.is_halted();
        let requests = ctx.take_checkpoints();
        drop(ctx);
        for request in requests {
            self.checkpoint()?
                .save_atomic(&request.path, request.keep_previous)?;
            info!("checkpoint written to {}", request.path.display());
        }

        Ok((!halted, halted))
    }

    /// Snapshot of every unit's state and the generator position.
    pub fn checkpoint(&self) -> FlowResult<Checkpoint> {
        let mut units = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(state) = node.unit.save_state()? {
                units.push((Checkpoint::unit_key(i, node.unit.name()), state));
            }
        }
        Ok(Checkpoint {
            passes: self.passes,
            units,
            rng: RngState {
                seed: self.rng.get_seed(),
                stream: self.rng.get_stream(),
                word_pos: self.rng.get_word_pos(),
            },
            device: self.device.as_ref().map(|d| d.guid().to_string()),
        })
    }

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> FlowResult<()> {
        self.checkpoint()?.save_atomic(path, false)
    }

    /// Loads `checkpoint` into the units and notifies them they resumed.
    ///
    /// Every entry must belong to a unit at the same position with the same
    /// name.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> FlowResult<()> {
        for (key, _) in &checkpoint.units {
            let known = self
                .nodes
                .iter()
                .enumerate()
                .any(|(i, n)| Checkpoint::unit_key(i, n.unit.name()) == *key);
            if !known {
                return Err(FlowError::Checkpoint(format!("no unit matches entry `{key}`")));
            }
        }

        for (i, node) in self.nodes.iter_mut().enumerate() {
            let key = Checkpoint::unit_key(i, node.unit.name());
            if let Some(state) = checkpoint.unit_state(&key) {
                node.unit.load_state(state).map_err(|e| wrap(node.unit.name(), e))?;
            }
        }

        let mut rng = ChaCha8Rng::from_seed(checkpoint.rng.seed);
        rng.set_stream(checkpoint.rng.stream);
        rng.set_word_pos(checkpoint.rng.word_pos);
        self.rng = rng;
        self.passes = checkpoint.passes;

        for node in &mut self.nodes {
            node.unit.resumed();
        }
        info!("restored checkpoint at pass {}", checkpoint.passes);
        Ok(())
    }

    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> FlowResult<()> {
        let checkpoint = Checkpoint::load(path)?;
        self.restore(&checkpoint)
    }
}

fn wrap(unit: &str, source: FlowError) -> FlowError {
    if source.is_configuration() {
        return source;
    }
    FlowError::Unit {
        unit: unit.to_string(),
        source: Box::new(source),
    }
}
