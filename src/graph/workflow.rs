//! The external start/wait protocol.
//!
//! ```text
//! workflow.initialize(&device)?;  // the end point releases the signal once
//! workflow.wait()?;
//! workflow.run()?;                // passes execute on a worker thread
//! workflow.wait()?;               // session budget exhausted or completed
//! let graph = workflow.join()?;
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info};
use parking_lot::{Condvar, Mutex};

use super::Graph;
use crate::backend::Device;
use crate::error::{FlowError, FlowResult};

/// Counting signal: every [`release`](Signal::release) lets exactly one
/// [`acquire`](Signal::acquire) through.
#[derive(Debug, Default)]
pub struct Signal {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Blocks until a release is available and consumes it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`acquire`](Signal::acquire), giving up after `timeout`.
    /// Returns whether a release was consumed.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Releases not yet consumed.
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

/// Runs a [`Graph`] on a worker thread behind the start/wait protocol.
pub struct Workflow {
    graph: Option<Graph>,
    signal: Arc<Signal>,
    failure: Arc<Mutex<Option<FlowError>>>,
    worker: Option<JoinHandle<Graph>>,
}

impl Workflow {
    pub fn new(graph: Graph) -> Self {
        let signal = graph.signal();
        Self {
            graph: Some(graph),
            signal,
            failure: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Initializes every unit of the graph on `device`.
    pub fn initialize(&mut self, device: &Device) -> FlowResult<()> {
        self.graph_mut()?.initialize(device)
    }

    /// Starts executing passes on a worker thread and returns immediately.
    pub fn run(&mut self) -> FlowResult<()> {
        let mut graph = self
            .graph
            .take()
            .ok_or_else(|| FlowError::Graph("the workflow is already running".into()))?;
        let signal = Arc::clone(&self.signal);
        let failure = Arc::clone(&self.failure);

        let worker = thread::Builder::new()
            .name("briny_flow-workflow".into())
            .spawn(move || {
                match graph.run() {
                    Ok(summary) if summary.halted => {
                        info!("workflow halted by its end point after {} passes", summary.passes);
                    }
                    Ok(summary) => {
                        info!("workflow stabilized after {} passes", summary.passes);
                        signal.release();
                    }
                    Err(e) => {
                        error!("workflow aborted: {e}");
                        *failure.lock() = Some(e);
                        signal.release();
                    }
                }
                graph
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Blocks until the completion signal is released. Returns the error
    /// that aborted the run, if any.
    pub fn wait(&self) -> FlowResult<()> {
        self.signal.acquire();
        self.take_failure()
    }

    /// Like [`wait`](Workflow::wait) with a timeout; `Ok(false)` if it expired.
    pub fn wait_timeout(&self, timeout: Duration) -> FlowResult<bool> {
        if !self.signal.acquire_timeout(timeout) {
            return Ok(false);
        }
        self.take_failure().map(|()| true)
    }

    /// Waits for the worker thread and takes the graph back.
    pub fn join(&mut self) -> FlowResult<&mut Graph> {
        if let Some(worker) = self.worker.take() {
            let graph = worker
                .join()
                .map_err(|_| FlowError::Graph("the workflow thread panicked".into()))?;
            self.graph = Some(graph);
        }
        self.graph_mut()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Waits for the worker thread and returns the graph.
    pub fn into_graph(mut self) -> FlowResult<Graph> {
        self.join()?;
        self.graph
            .take()
            .ok_or_else(|| FlowError::Graph("the workflow has no graph".into()))
    }

    fn graph_mut(&mut self) -> FlowResult<&mut Graph> {
        self.graph
            .as_mut()
            .ok_or_else(|| FlowError::Graph("the workflow is running".into()))
    }

    fn take_failure(&self) -> FlowResult<()> {
        match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
