//! Ready-made units.
//!
//! - [`Repeater`]: pass-through loop re-entry point.
//! - [`EndPoint`]: pass counters, checkpoints and the completion signal.
//! - [`Decision`]: turns per-batch error counts into epoch results and a
//!   completion flag.
//! - [`MemoryLoader`]: serves minibatches from memory.
//! - [`EvaluatorSoftmax`] and [`EvaluatorMse`]: score network outputs on
//!   either backend.

mod decision;
mod end_point;
pub mod evaluator;
mod loader;
mod repeater;

pub use decision::{Decision, DecisionConfig};
pub use end_point::EndPoint;
pub use evaluator::{EvaluatorMse, EvaluatorSoftmax, MseMetrics};
pub use loader::MemoryLoader;
pub use repeater::Repeater;
