//! Single-flight background bundle adjustment.
//!
//! The worker owns a snapshot of the problem and only sends its result back
//! over a channel; applying it is left to the mapper, which stays the single
//! writer of the model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use tracing::{debug, warn};

use crate::error::MapperError;
use crate::optimizer::{solve_bundle, BundleAdjustmentConfig, BundleProblem, BundleResult};

#[derive(Debug, Clone, Default)]
pub enum TaskState {
    #[default]
    Idle,
    Running,
    Completed(BundleResult),
    Failed(String),
    Cancelled,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }
}

#[derive(Default)]
pub struct BundleTask {
    state: TaskState,
    cancel: Arc<AtomicBool>,
    receiver: Option<Receiver<Option<BundleResult>>>,
    handle: Option<JoinHandle<()>>,
}

impl BundleTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts optimizing `problem` on a worker thread.
    ///
    /// Refuses while a previous task is still running. An unconsumed result
    /// of a finished task is dropped.
    pub fn start(
        &mut self,
        problem: BundleProblem,
        config: BundleAdjustmentConfig,
    ) -> Result<(), MapperError> {
        if self.state.is_running() {
            return Err(MapperError::TaskAlreadyRunning);
        }
        self.join();
        self.cancel.store(false, Ordering::SeqCst);
        self.launch(problem, config);
        Ok(())
    }

    fn launch(&mut self, problem: BundleProblem, config: BundleAdjustmentConfig) {
        let (sender, receiver) = bounded(1);
        let cancel = Arc::clone(&self.cancel);
        debug!(
            "starting background bundle adjustment: {} frames, {} markers, {} observations",
            problem.frames.len(),
            problem.markers.len(),
            problem.observations.len()
        );
        let handle = thread::spawn(move || {
            let should_stop = || cancel.load(Ordering::SeqCst);
            let result = solve_bundle(&problem, &config, &should_stop);
            // The receiver may be gone if the task was dropped.
            let _ = sender.send(result);
        });
        self.receiver = Some(receiver);
        self.handle = Some(handle);
        self.state = TaskState::Running;
    }

    /// Current state, picking up a finished result without blocking.
    pub fn poll(&mut self) -> &TaskState {
        if self.state.is_running() {
            let received = match &self.receiver {
                Some(rx) => match rx.try_recv() {
                    Ok(result) => Some(Ok(result)),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => Some(Err(())),
                },
                None => Some(Err(())),
            };
            if let Some(received) = received {
                self.finish(received);
            }
        }
        &self.state
    }

    /// Blocks until the running task, if any, has finished.
    pub fn wait(&mut self) -> &TaskState {
        if self.state.is_running() {
            let received = match &self.receiver {
                Some(rx) => rx.recv().map_err(|_| ()),
                None => Err(()),
            };
            self.finish(received);
        }
        &self.state
    }

    pub fn is_running(&mut self) -> bool {
        self.poll().is_running()
    }

    /// Takes a completed result, returning the task to `Idle`.
    ///
    /// Failed and cancelled tasks are also returned to `Idle`.
    pub fn take_result(&mut self) -> Option<BundleResult> {
        if self.poll().is_running() {
            return None;
        }
        match std::mem::take(&mut self.state) {
            TaskState::Completed(result) => Some(result),
            TaskState::Failed(reason) => {
                warn!("background bundle adjustment failed: {}", reason);
                None
            }
            TaskState::Cancelled => {
                debug!("background bundle adjustment was cancelled");
                None
            }
            TaskState::Idle | TaskState::Running => None,
        }
    }

    /// Asks the running task to stop at its next iteration.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn finish(&mut self, received: Result<Option<BundleResult>, ()>) {
        self.state = match received {
            Ok(Some(result)) => TaskState::Completed(result),
            Ok(None) if self.cancel.load(Ordering::SeqCst) => TaskState::Cancelled,
            Ok(None) => TaskState::Failed(String::from("nothing to optimize")),
            Err(()) => TaskState::Failed(String::from("worker exited without a result")),
        };
        self.receiver = None;
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("bundle adjustment worker panicked");
            }
        }
    }
}

impl Drop for BundleTask {
    fn drop(&mut self) {
        self.cancel();
        self.join();
    }
}
