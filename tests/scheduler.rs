use briny_flow::attr::{Attr, AttrHandle, AttrRef, Slot};
use briny_flow::backend::Device;
use briny_flow::config::CompletionConfig;
use briny_flow::graph::{Gate, Graph, RunSummary, UnitId, Workflow};
use briny_flow::ops::dispatch::Accelerated;
use briny_flow::tensors::Tensor;
use briny_flow::unit::{InitContext, RunContext, Unit, UnitState, bind_slot};
use briny_flow::units::{Decision, DecisionConfig, EndPoint, EvaluatorSoftmax, MemoryLoader};
use briny_flow::{FlowError, FlowResult};
use rand::RngCore;

/// Counts its runs and records one random draw per run.
struct Counter {
    name: String,
    count: Attr<u64>,
    draws: Attr<Vec<u32>>,
    initialized: Attr<bool>,
    fail_at: Option<u64>,
}

struct CounterView {
    count: AttrRef<u64>,
    draws: AttrRef<Vec<u32>>,
    initialized: AttrRef<bool>,
}

impl Counter {
    fn new(name: &str) -> (Self, CounterView) {
        let counter = Self {
            name: name.to_string(),
            count: Attr::new(0),
            draws: Attr::new(Vec::new()),
            initialized: Attr::new(false),
            fail_at: None,
        };
        let view = CounterView {
            count: counter.count.share(),
            draws: counter.draws.share(),
            initialized: counter.initialized.share(),
        };
        (counter, view)
    }
}

impl Unit for Counter {
    fn name(&self) -> &str {
        &self.name
    }

    fn outputs(&self) -> Vec<AttrHandle> {
        vec![self.count.handle("count")]
    }

    fn initialize(&mut self, _ctx: &mut InitContext<'_>) -> FlowResult<()> {
        self.initialized.set(true);
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> FlowResult<()> {
        let count = {
            let mut count = self.count.write();
            *count += 1;
            *count
        };
        self.draws.write().push(ctx.rng.next_u32());
        if self.fail_at == Some(count) {
            return Err(FlowError::Gpu("device lost".into()));
        }
        Ok(())
    }

    fn save_state(&self) -> FlowResult<Option<Vec<u8>>> {
        Ok(Some(self.count.get().to_le_bytes().to_vec()))
    }

    fn load_state(&mut self, state: &[u8]) -> FlowResult<()> {
        let bytes: [u8; 8] = state
            .try_into()
            .map_err(|_| FlowError::Checkpoint("bad counter state".into()))?;
        self.count.set(u64::from_le_bytes(bytes));
        Ok(())
    }
}

/// Demands a `u64` input.
struct Sink {
    input: Slot<u64>,
}

impl Unit for Sink {
    fn name(&self) -> &str {
        "sink"
    }

    fn unbound(&self) -> Vec<&'static str> {
        if self.input.is_bound() { vec![] } else { vec!["input"] }
    }

    fn bind_input(&mut self, input: &str, source: &AttrHandle) -> FlowResult<()> {
        match input {
            "input" => bind_slot("sink", &mut self.input, source),
            _ => Err(briny_flow::unit::no_such_input("sink", input)),
        }
    }

    fn initialize(&mut self, _ctx: &mut InitContext<'_>) -> FlowResult<()> {
        Ok(())
    }

    fn run(&mut self, _ctx: &mut RunContext<'_>) -> FlowResult<()> {
        self.input.get("sink")?;
        Ok(())
    }
}

fn completion(max_passes: u64) -> CompletionConfig {
    CompletionConfig {
        max_passes,
        snapshot_frequency: 0,
        snapshot_dir: None,
        improvement_warmup: 0,
    }
}

/// start -> a -> b -> end, with a repeat link b => a.
fn cycle(seed: u64, max_passes: u64) -> (Graph, CounterView, CounterView, AttrRef<u64>, UnitId) {
    let mut graph = Graph::with_seed(seed);
    let (a, a_view) = Counter::new("a");
    let (b, b_view) = Counter::new("b");
    let end = EndPoint::new("end", completion(max_passes));
    let total = end.total_passes.share();

    let a = graph.add(a);
    let b = graph.add(b);
    let end = graph.add(end);
    graph.link_from(a, graph.start()).unwrap();
    graph.link_from(b, a).unwrap();
    graph.repeat_from(a, b).unwrap();
    graph.link_from(end, b).unwrap();
    graph.set_end(end).unwrap();
    (graph, a_view, b_view, total, end)
}

#[test]
fn test_cycle_stops_at_session_cap() {
    let (graph, a, b, total, _) = cycle(0, 5);
    let mut workflow = Workflow::new(graph);
    workflow.initialize(&Device::Cpu).unwrap();
    workflow.wait().unwrap();
    workflow.run().unwrap();
    workflow.wait().unwrap();

    let graph = workflow.join().unwrap();
    assert_eq!(graph.passes(), 5);
    assert_eq!(a.count.get(), 5);
    assert_eq!(b.count.get(), 5);
    assert_eq!(total.get(), 5);
}

#[test]
fn test_run_reports_halt() {
    let (mut graph, _, _, _, end) = cycle(0, 3);
    graph.initialize(&Device::Cpu).unwrap();
    let summary = graph.run().unwrap();
    assert_eq!(
        summary,
        RunSummary {
            passes: 3,
            halted: true
        }
    );
    assert_eq!(graph.state(end), Some(UnitState::Initialized));
}

#[test]
fn test_graph_without_repeat_stabilizes() {
    let mut graph = Graph::new();
    let (a, a_view) = Counter::new("a");
    let a = graph.add(a);
    let end = graph.add(EndPoint::new("end", completion(100)));
    graph.link_from(a, graph.start()).unwrap();
    graph.link_from(end, a).unwrap();
    graph.set_end(end).unwrap();

    let mut workflow = Workflow::new(graph);
    workflow.initialize(&Device::Cpu).unwrap();
    workflow.wait().unwrap();
    workflow.run().unwrap();
    workflow.wait().unwrap();
    assert_eq!(a_view.count.get(), 1);
}

#[test]
fn test_block_gate_stops_successors() {
    let (mut graph, a, b, _, _) = cycle(0, 4);
    let (c, c_view) = Counter::new("c");
    let (d, d_view) = Counter::new("d");
    let c = graph.add(c);
    let d = graph.add(d);
    graph.link_from(c, graph.start()).unwrap();
    graph.link_from(d, c).unwrap();

    let closed = Attr::new(true);
    graph.gate_block(c, Gate::flag(&closed)).unwrap();
    graph.initialize(&Device::Cpu).unwrap();
    graph.run().unwrap();

    assert_eq!(a.count.get(), 4);
    assert_eq!(b.count.get(), 4);
    assert_eq!(c_view.count.get(), 0);
    assert_eq!(d_view.count.get(), 0);
}

#[test]
fn test_skip_gate_notifies_successors() {
    let mut graph = Graph::new();
    let (c, c_view) = Counter::new("c");
    let (d, d_view) = Counter::new("d");
    let c = graph.add(c);
    let d = graph.add(d);
    let end = graph.add(EndPoint::new("end", completion(4)));
    graph.link_from(c, graph.start()).unwrap();
    graph.link_from(d, c).unwrap();
    graph.link_from(end, d).unwrap();
    graph.repeat_from(c, end).unwrap();
    graph.set_end(end).unwrap();

    // skip `c` while `d` has run exactly once
    let d_count = graph.output::<u64>(d, "count").unwrap();
    let once = Gate::at_least(d_count.clone(), 1.0) & Gate::below(d_count, 2.0);
    graph.gate_skip(c, once).unwrap();

    graph.initialize(&Device::Cpu).unwrap();
    let summary = graph.run().unwrap();
    assert_eq!(summary.passes, 4);
    assert_eq!(d_view.count.get(), 4);
    assert_eq!(c_view.count.get(), 3);
}

#[test]
fn test_unit_failure_reaches_waiter() {
    let mut graph = Graph::new();
    let (mut a, a_view) = Counter::new("a");
    a.fail_at = Some(3);
    let a = graph.add(a);
    let end = graph.add(EndPoint::new("end", completion(10)));
    graph.link_from(a, graph.start()).unwrap();
    graph.link_from(end, a).unwrap();
    graph.repeat_from(a, end).unwrap();
    graph.set_end(end).unwrap();

    let mut workflow = Workflow::new(graph);
    workflow.initialize(&Device::Cpu).unwrap();
    workflow.wait().unwrap();
    workflow.run().unwrap();
    let err = workflow.wait().unwrap_err();
    match err {
        FlowError::Unit { unit, source } => {
            assert_eq!(unit, "a");
            assert!(matches!(*source, FlowError::Gpu(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(a_view.count.get(), 3);
    assert_eq!(workflow.join().unwrap().passes(), 3);
}

#[test]
fn test_unbound_input_fails_before_any_initialization() {
    let mut graph = Graph::new();
    let (a, a_view) = Counter::new("a");
    let a = graph.add(a);
    let sink = graph.add(Sink { input: Slot::new("input") });
    let end = graph.add(EndPoint::new("end", completion(1)));
    graph.link_from(a, graph.start()).unwrap();
    graph.link_from(sink, a).unwrap();
    graph.link_from(end, sink).unwrap();
    graph.set_end(end).unwrap();

    let err = graph.initialize(&Device::Cpu).unwrap_err();
    assert!(matches!(err, FlowError::Configuration { ref attr, .. } if attr == "input"));
    assert!(!a_view.initialized.get());

    graph.bind(sink, "input", a, "count").unwrap();
    graph.initialize(&Device::Cpu).unwrap();
    assert!(a_view.initialized.get());
}

#[test]
fn test_wiring_errors() {
    let mut graph = Graph::new();
    let (a, _) = Counter::new("a");
    let (b, _) = Counter::new("b");
    let a = graph.add(a);
    let b = graph.add(b);
    graph.link_from(a, graph.start()).unwrap();
    graph.link_from(b, a).unwrap();

    let err = graph.initialize(&Device::Cpu).unwrap_err();
    assert!(err.is_configuration());

    graph.set_end(b).unwrap();
    graph.link_from(a, b).unwrap();
    let err = graph.initialize(&Device::Cpu).unwrap_err();
    assert!(matches!(err, FlowError::Graph(_)));

    assert!(graph.link_from(b, a).is_err());
    assert!(graph.bind(b, "input", a, "missing").is_err());
}

#[test]
fn test_checkpoint_resumes_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cycle.bfck");

    let (mut reference, ref_a, _, _, _) = cycle(42, 10);
    reference.initialize(&Device::Cpu).unwrap();
    reference.run().unwrap();

    let (mut first, first_a, _, _, _) = cycle(42, 5);
    first.initialize(&Device::Cpu).unwrap();
    first.run().unwrap();
    first.save_checkpoint(&path).unwrap();

    let (mut second, second_a, _, total, _) = cycle(0, 5);
    second.initialize(&Device::Cpu).unwrap();
    second.load_checkpoint(&path).unwrap();
    assert_eq!(second_a.count.get(), 5);
    assert_eq!(total.get(), 5);
    second.run().unwrap();

    assert_eq!(total.get(), 10);
    assert_eq!(second.passes(), 10);
    let mut resumed = first_a.draws.get();
    resumed.extend(second_a.draws.get());
    assert_eq!(resumed, ref_a.draws.get());
}

#[test]
fn test_end_point_writes_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = Graph::new();
    let (a, _) = Counter::new("a");
    let a = graph.add(a);
    let end = graph.add(EndPoint::new(
        "end",
        CompletionConfig {
            max_passes: 4,
            snapshot_frequency: 2,
            snapshot_dir: Some(dir.path().to_path_buf()),
            improvement_warmup: 0,
        },
    ));
    graph.link_from(a, graph.start()).unwrap();
    graph.link_from(end, a).unwrap();
    graph.repeat_from(a, end).unwrap();
    graph.set_end(end).unwrap();
    graph.initialize(&Device::Cpu).unwrap();
    graph.run().unwrap();

    assert!(dir.path().join("end_2.bfck").exists());
    assert!(dir.path().join("end_4.bfck").exists());
    assert!(!dir.path().join("end_3.bfck").exists());
    let snapshot = briny_flow::graph::Checkpoint::load(dir.path().join("end_2.bfck")).unwrap();
    assert_eq!(snapshot.passes, 2);
    assert_eq!(snapshot.device.as_deref(), Some("cpu"));
}

#[test]
fn test_input_must_be_produced_earlier_in_the_pass() {
    let mut graph = Graph::new();
    let (a, _) = Counter::new("a");
    let (b, b_view) = Counter::new("b");
    let a = graph.add(a);
    let sink = graph.add(Sink { input: Slot::new("input") });
    let b = graph.add(b);
    let end = graph.add(EndPoint::new("end", completion(1)));
    graph.link_from(a, graph.start()).unwrap();
    graph.link_from(sink, a).unwrap();
    graph.link_from(b, sink).unwrap();
    graph.link_from(end, b).unwrap();
    graph.set_end(end).unwrap();

    // `b` runs after `sink`, which would read the previous pass
    graph.bind(sink, "input", b, "count").unwrap();
    let err = graph.initialize(&Device::Cpu).unwrap_err();
    assert!(matches!(err, FlowError::Graph(ref msg) if msg.contains("sink.input")));
    assert!(!b_view.initialized.get());

    graph.bind(sink, "input", a, "count").unwrap();
    graph.initialize(&Device::Cpu).unwrap();
    assert!(b_view.initialized.get());
}

#[test]
fn test_decision_completes_the_run() {
    // sample 3 is always misclassified
    let samples = Tensor::new(
        vec![5, 3],
        vec![
            0.7f32, 0.2, 0.1, //
            0.1, 0.8, 0.1, //
            0.2, 0.2, 0.6, //
            0.6, 0.3, 0.1, //
            0.1, 0.1, 0.8,
        ],
    );
    let loader = MemoryLoader::new("loader", samples, 2)
        .unwrap()
        .with_labels(vec![0, 1, 2, 1, 2])
        .unwrap();
    let decision = Decision::new(
        "decision",
        DecisionConfig {
            fail_iterations: 3,
            max_epochs: None,
        },
    );
    let epoch_n_err = decision.epoch_n_err.share();
    let best_n_err = decision.best_n_err.share();
    let end = EndPoint::new("end", completion(0));
    let total = end.total_passes.share();

    let mut graph = Graph::new();
    let loader = graph.add(loader);
    let ev = graph.add(Accelerated::new(EvaluatorSoftmax::new("ev")));
    let decision = graph.add(decision);
    let end = graph.add(end);
    graph.link_from(loader, graph.start()).unwrap();
    graph.link_from(ev, loader).unwrap();
    graph.link_from(decision, ev).unwrap();
    graph.link_from(end, decision).unwrap();
    graph.repeat_from(graph.start(), end).unwrap();
    graph.set_end(end).unwrap();

    graph.bind(ev, "output", loader, "minibatch_data").unwrap();
    graph.bind(ev, "labels", loader, "minibatch_labels").unwrap();
    graph.bind(ev, "batch_size", loader, "minibatch_size").unwrap();
    graph.bind(decision, "epoch_ended", loader, "epoch_ended").unwrap();
    graph.bind(decision, "minibatch_n_err", ev, "n_err").unwrap();
    graph.bind(end, "completed", decision, "complete").unwrap();

    let mut workflow = Workflow::new(graph);
    workflow.initialize(&Device::Cpu).unwrap();
    workflow.wait().unwrap();
    workflow.run().unwrap();
    workflow.wait().unwrap();
    let graph = workflow.join().unwrap();

    // three passes per epoch; the best is set in epoch 1, then 3 stalled epochs
    assert_eq!(total.get(), 12);
    assert_eq!(graph.passes(), 12);
    assert_eq!(epoch_n_err.get(), 1);
    assert_eq!(best_n_err.get(), 1);
}
