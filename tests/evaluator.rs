use briny_flow::attr::Attr;
use briny_flow::backend::{Backend, Device};
use briny_flow::graph::Signal;
use briny_flow::ops::dispatch::Accelerated;
use briny_flow::tensors::Tensor;
use briny_flow::unit::{InitContext, RunContext, Unit};
use briny_flow::units::{EvaluatorMse, EvaluatorSoftmax, MseMetrics};
use briny_flow::FlowError;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const OUTPUTS: [f32; 12] = [
    0.1, 0.7, 0.2, //
    0.8, 0.1, 0.1, //
    0.2, 0.2, 0.6, //
    0.4, 0.4, 0.2,
];

struct SoftmaxFixture {
    output: Attr<Tensor<f32>>,
    labels: Attr<Vec<i32>>,
    batch_size: Attr<usize>,
    unit: Accelerated<EvaluatorSoftmax>,
    signal: Signal,
    rng: ChaCha8Rng,
}

impl SoftmaxFixture {
    fn new(labels: Vec<i32>) -> Self {
        let batch_size = labels.len();
        let output = Attr::new(Tensor::new(vec![4, 3], OUTPUTS.to_vec()));
        let labels = Attr::new(labels);
        let batch_size = Attr::new(batch_size);

        let mut unit = Accelerated::new(EvaluatorSoftmax::new("ev").averaged(false));
        unit.bind_input("output", &output.handle("output")).unwrap();
        unit.bind_input("labels", &labels.handle("labels")).unwrap();
        unit.bind_input("batch_size", &batch_size.handle("batch_size")).unwrap();

        Self {
            output,
            labels,
            batch_size,
            unit,
            signal: Signal::new(),
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    fn initialize(&mut self) {
        self.unit
            .initialize(&mut InitContext::new(&Device::Cpu, &self.signal))
            .unwrap();
    }

    fn run(&mut self) {
        self.unit
            .run(&mut RunContext::new(&mut self.rng, &self.signal))
            .unwrap();
    }
}

#[test]
fn test_softmax_all_correct() {
    let mut f = SoftmaxFixture::new(vec![1, 0, 2, 0]);
    f.initialize();
    f.run();

    let ev = f.unit.inner();
    assert_eq!(ev.n_err.get(), 0);
    let confusion = ev.confusion_matrix.get();
    assert_eq!(confusion.shape, vec![3, 3]);
    assert_eq!(confusion.data, vec![2, 0, 0, 0, 1, 0, 0, 0, 1]);
}

#[test]
fn test_softmax_one_mislabeled() {
    let mut f = SoftmaxFixture::new(vec![1, 0, 2, 1]);
    f.initialize();
    f.run();

    let ev = f.unit.inner();
    assert_eq!(ev.n_err.get(), 1);
    let confusion = ev.confusion_matrix.get();
    // row-major [predicted][label]: predicted 0, label 1
    assert_eq!(confusion.data[1], 1);
    assert_eq!(confusion.data.iter().sum::<u32>(), 4);
}

#[test]
fn test_softmax_error_and_worst_sample() {
    let mut f = SoftmaxFixture::new(vec![1, 0, 2, 0]);
    f.initialize();
    f.run();

    let ev = f.unit.inner();
    let err = ev.err_output.get();
    let expected = [-0.2, 0.1, 0.1];
    for (e, x) in err.row(1).iter().zip(expected) {
        assert!((e - x).abs() < 1e-6);
    }
    // sum |err| of the last sample: 0.6 + 0.4 + 0.2
    assert!((ev.max_err_output_sum.get() - 1.2).abs() < 1e-5);
}

#[test]
fn test_softmax_confusion_counts_labeled_samples() {
    let mut f = SoftmaxFixture::new(vec![1, -1, 2, 0]);
    f.initialize();
    f.run();

    let ev = f.unit.inner();
    assert_eq!(ev.confusion_matrix.get().data.iter().sum::<u32>(), 3);
    assert!(ev.err_output.get().row(1).iter().all(|&e| e == 0.0));
    assert_eq!(ev.n_err.get(), 0);
}

#[test]
fn test_softmax_rows_past_batch_are_zeroed() {
    let mut f = SoftmaxFixture::new(vec![1, 0, 2, 0]);
    f.initialize();
    f.run();
    f.batch_size.set(2);
    f.labels.set(vec![1, 0, 1, 1]);
    f.run();

    let ev = f.unit.inner();
    let err = ev.err_output.get();
    assert!(err.row(2).iter().chain(err.row(3)).all(|&e| e == 0.0));
    // results are per pass, not accumulated
    assert_eq!(ev.confusion_matrix.get().data.iter().sum::<u32>(), 2);
    assert_eq!(ev.n_err.get(), 0);
}

#[test]
fn test_softmax_averaging_scales_error() {
    let output = Attr::new(Tensor::new(vec![4, 3], OUTPUTS.to_vec()));
    let labels = Attr::new(vec![1, 0, 2, 0]);
    let batch_size = Attr::new(4usize);
    let mut unit = Accelerated::new(EvaluatorSoftmax::new("ev"));
    unit.bind_input("output", &output.handle("output")).unwrap();
    unit.bind_input("labels", &labels.handle("labels")).unwrap();
    unit.bind_input("batch_size", &batch_size.handle("batch_size")).unwrap();

    let signal = Signal::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    unit.initialize(&mut InitContext::new(&Device::Cpu, &signal)).unwrap();
    unit.run(&mut RunContext::new(&mut rng, &signal)).unwrap();

    let err = unit.inner().err_output.get();
    assert!((err.row(0)[1] - (0.7 - 1.0) / 4.0).abs() < 1e-6);
}

#[test]
fn test_initialize_is_idempotent() {
    let mut f = SoftmaxFixture::new(vec![1, 0, 2, 0]);
    f.initialize();
    f.run();
    let before = f.unit.inner().confusion_matrix.get();

    f.initialize();
    assert_eq!(f.unit.initializations(), 1);
    assert_eq!(f.unit.backend(), Some(Backend::Cpu));
    f.run();
    assert_eq!(f.unit.inner().confusion_matrix.get(), before);

    f.output.set(Tensor::new(vec![2, 3], OUTPUTS[..6].to_vec()));
    f.labels.set(vec![1, 0]);
    f.batch_size.set(2);
    f.initialize();
    assert_eq!(f.unit.initializations(), 2);
    assert_eq!(f.unit.inner().err_output.get().shape, vec![2, 3]);
}

#[test]
fn test_unbound_input_is_configuration_error() {
    let output = Attr::new(Tensor::new(vec![4, 3], OUTPUTS.to_vec()));
    let mut unit = Accelerated::new(EvaluatorSoftmax::new("ev"));
    unit.bind_input("output", &output.handle("output")).unwrap();

    let signal = Signal::new();
    let err = unit
        .initialize(&mut InitContext::new(&Device::Cpu, &signal))
        .unwrap_err();
    match err {
        FlowError::Configuration { unit, attr } => {
            assert_eq!(unit, "ev");
            assert_eq!(attr, "labels");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_binding_wrong_type_fails() {
    let labels = Attr::new(vec![0.5f32]);
    let mut unit = Accelerated::new(EvaluatorSoftmax::new("ev"));
    assert!(unit.bind_input("labels", &labels.handle("labels")).is_err());
    assert!(unit.bind_input("nonexistent", &labels.handle("labels")).is_err());
}

struct MseFixture {
    output: Attr<Tensor<f32>>,
    target: Attr<Tensor<f32>>,
    labels: Attr<Vec<i32>>,
    batch_size: Attr<usize>,
}

impl MseFixture {
    fn new(output: Vec<f32>, target: Vec<f32>, labels: Vec<i32>) -> Self {
        let rows = labels.len();
        let y = output.len() / rows;
        Self {
            output: Attr::new(Tensor::new(vec![rows, y], output)),
            target: Attr::new(Tensor::new(vec![rows, y], target)),
            labels: Attr::new(labels),
            batch_size: Attr::new(rows),
        }
    }

    fn bind(&self, ev: EvaluatorMse) -> Accelerated<EvaluatorMse> {
        let mut unit = Accelerated::new(ev);
        unit.bind_input("output", &self.output.handle("output")).unwrap();
        unit.bind_input("target", &self.target.handle("target")).unwrap();
        unit.bind_input("labels", &self.labels.handle("labels")).unwrap();
        unit.bind_input("batch_size", &self.batch_size.handle("batch_size")).unwrap();
        unit
    }
}

fn run_once<U: Unit>(unit: &mut U) -> Result<(), FlowError> {
    let signal = Signal::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    unit.initialize(&mut InitContext::new(&Device::Cpu, &signal))?;
    unit.run(&mut RunContext::new(&mut rng, &signal))
}

#[test]
fn test_mse_perfect_output() {
    let data = vec![1.0, 0.0, 0.0, 1.0, 0.5, 0.5];
    let f = MseFixture::new(data.clone(), data, vec![0, 1, 0]);
    let targets = Tensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]);
    let mut unit = f.bind(EvaluatorMse::new("mse").with_class_targets(targets));
    run_once(&mut unit).unwrap();

    let ev = unit.inner();
    assert_eq!(ev.mse.get(), vec![0.0; 3]);
    assert_eq!(
        ev.metrics.get(),
        MseMetrics {
            sum: 0.0,
            max: 0.0,
            min: 0.0
        }
    );
    assert!(ev.err_output.get().data.iter().all(|&e| e == 0.0));
    // [0.5, 0.5] is equally close to both classes; the first wins
    assert_eq!(ev.n_err.get(), 0);
}

#[test]
fn test_mse_nearest_class_counts_mismatches() {
    let output = vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4];
    let f = MseFixture::new(output.clone(), output, vec![0, 0, 1]);
    let targets = Tensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]);
    let mut unit = f.bind(EvaluatorMse::new("mse").with_class_targets(targets));
    run_once(&mut unit).unwrap();
    assert_eq!(unit.inner().n_err.get(), 2);
}

#[test]
fn test_mse_root_and_squared() {
    let f = MseFixture::new(vec![3.0, 0.0], vec![0.0, 4.0], vec![0]);

    let mut root = f.bind(EvaluatorMse::new("mse").averaged(false));
    run_once(&mut root).unwrap();
    // sqrt((9 + 16) / 2)
    assert!((root.inner().mse.get()[0] - 12.5f32.sqrt()).abs() < 1e-5);
    assert_eq!(root.inner().err_output.get().data, vec![3.0, -4.0]);

    let mut squared = f.bind(EvaluatorMse::new("mse").squared(true));
    run_once(&mut squared).unwrap();
    assert!((squared.inner().mse.get()[0] - 12.5).abs() < 1e-5);
}

#[test]
fn test_mse_metrics_accumulate_until_reset() {
    let f = MseFixture::new(vec![1.0, 0.0], vec![0.0, 0.0], vec![0]);
    let mut unit = f.bind(EvaluatorMse::new("mse").squared(true));
    let signal = Signal::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    unit.initialize(&mut InitContext::new(&Device::Cpu, &signal)).unwrap();
    unit.run(&mut RunContext::new(&mut rng, &signal)).unwrap();
    unit.run(&mut RunContext::new(&mut rng, &signal)).unwrap();

    let metrics = unit.inner().metrics.get();
    assert!((metrics.sum - 1.0).abs() < 1e-6);
    assert!((metrics.max - 0.5).abs() < 1e-6);
    assert!((metrics.min - 0.5).abs() < 1e-6);

    unit.inner().reset_metrics();
    assert_eq!(unit.inner().metrics.get(), MseMetrics::default());
}

#[test]
fn test_mse_size_mismatch() {
    let output = Attr::new(Tensor::new(vec![2, 2], vec![0.0f32; 4]));
    let target = Attr::new(Tensor::new(vec![2, 3], vec![0.0f32; 6]));
    let batch_size = Attr::new(2usize);
    let mut unit = Accelerated::new(EvaluatorMse::new("mse"));
    unit.bind_input("output", &output.handle("output")).unwrap();
    unit.bind_input("target", &target.handle("target")).unwrap();
    unit.bind_input("batch_size", &batch_size.handle("batch_size")).unwrap();

    let err = run_once(&mut unit).unwrap_err();
    assert!(matches!(err, FlowError::ShapeMismatch { .. }));
}
