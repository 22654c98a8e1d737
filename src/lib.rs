//! briny_flow: a gated dataflow engine for iterative numeric workloads.
//!
//! A run is a graph of units executed pass after pass until a completion
//! condition holds. Each unit that does numeric work runs either on the CPU
//! or, with the `wgpu` feature, on an accelerator chosen once per process by
//! measuring every device present.
//!
//! # Modules
//!
//! - [`graph`]: the scheduler: links, gates, passes, checkpoints and the
//!   start/wait [`Workflow`](graph::Workflow).
//! - [`unit`] and [`attr`]: the unit lifecycle and how units share data.
//! - [`units`]: ready-made units (loader, evaluators, decision, end point).
//! - [`ops`]: CPU and accelerator kernels behind one dispatch contract.
//! - [`device`]: device discovery, benchmarking and selection.
//! - [`config`], [`error`], [`tensors`], [`approx`], [`backend`].
//!
//! # Example
//!
//! ```rust
//! use briny_flow::backend::Device;
//! use briny_flow::config::CompletionConfig;
//! use briny_flow::graph::{Graph, Workflow};
//! use briny_flow::units::{EndPoint, Repeater};
//!
//! let mut graph = Graph::new();
//! let body = graph.add(Repeater::new("body"));
//! let end = graph.add(EndPoint::new(
//!     "end",
//!     CompletionConfig { max_passes: 3, ..Default::default() },
//! ));
//! graph.link_from(body, graph.start()).unwrap();
//! graph.link_from(end, body).unwrap();
//! graph.repeat_from(body, end).unwrap();
//! graph.set_end(end).unwrap();
//!
//! let mut workflow = Workflow::new(graph);
//! workflow.initialize(&Device::Cpu).unwrap();
//! workflow.wait().unwrap();
//! workflow.run().unwrap();
//! workflow.wait().unwrap();
//! assert_eq!(workflow.join().unwrap().passes(), 3);
//! ```

pub mod approx;
pub mod attr;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod ops;
pub mod tensors;
pub mod unit;
pub mod units;

pub use error::{FlowError, FlowResult};
