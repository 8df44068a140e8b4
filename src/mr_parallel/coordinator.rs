use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use futures::future::join_all;
use tracing::{error, info};

use crate::common::{Completion, JobSpec, Phase, Task};
use crate::error::{EngineError, Result};
use crate::store::output_name;

use super::worker_pool::Dispatcher;

/// Drives one job through its map and reduce phases.
pub struct Coordinator {
    job: JobSpec,
    dispatcher: Dispatcher,
}

impl Coordinator {
    pub fn new(job: JobSpec, dispatcher: Dispatcher) -> Self {
        Self { job, dispatcher }
    }

    pub async fn run(self) -> Result<Vec<PathBuf>> {
        let job = &self.job;
        let started = Instant::now();
        fs::create_dir_all(&job.data_dir).map_err(|source| EngineError::DataDir {
            path: job.data_dir.clone(),
            source,
        })?;

        info!(job = %job.name, n_map = job.n_map(), n_reduce = job.n_reduce, "map phase started");
        let map_tasks: Vec<_> = (0..job.n_map()).map(|index| Task::map(job, index)).collect();
        self.run_phase(Phase::Map, map_tasks).await?;

        info!(job = %job.name, "reduce phase started");
        let reduce_tasks: Vec<_> = (0..job.n_reduce)
            .map(|index| Task::reduce(job, index))
            .collect();
        self.run_phase(Phase::Reduce, reduce_tasks).await?;

        info!(
            job = %job.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        Ok((0..job.n_reduce)
            .map(|index| output_name(&job.data_dir, &job.name, index))
            .collect())
    }

    /// Dispatches every task of a phase at once, then waits for all of them.
    ///
    /// The wait covers every task even after one has failed, so when an error
    /// is returned nothing of this phase is still running.
    async fn run_phase(&self, phase: Phase, tasks: Vec<(Task, Completion)>) -> Result<()> {
        let (tasks, completions): (Vec<Task>, Vec<Completion>) = tasks.into_iter().unzip();

        let dispatches = tasks.into_iter().map(|task| self.dispatcher.dispatch(task));
        let dispatched = join_all(dispatches).await;
        let finished = join_all(completions.into_iter().map(Completion::wait)).await;

        let failures = finished.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            error!(job = %self.job.name, %phase, failures, "phase failed");
        }
        dispatched.into_iter().chain(finished).collect()
    }
}
