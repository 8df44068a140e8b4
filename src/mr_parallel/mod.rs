mod coordinator;
mod worker_pool;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::channel::oneshot;
use futures_lite::future;
use tracing::info;

use crate::common::{JobSpec, MapReduce};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use coordinator::Coordinator;
pub use worker_pool::{Dispatcher, WorkerPool};

/// A running cluster: one worker pool shared by every submitted job.
pub struct Engine {
    pool: WorkerPool,
}

impl Engine {
    pub fn start(config: EngineConfig) -> io::Result<Engine> {
        let pool = WorkerPool::start(config.workers.max(1))?;
        info!(workers = pool.size(), "engine started");
        Ok(Engine { pool })
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// Starts the job in the background. The returned handle resolves once,
    /// with every output path or with the error that aborted the job.
    pub fn submit(&self, job: JobSpec) -> JobHandle {
        let (notify, rx) = oneshot::channel();
        let handle = JobHandle {
            job: job.name.clone(),
            rx,
        };

        if let Err(err) = job.validate() {
            let _ = notify.send(Err(err));
            return handle;
        }

        let coordinator = Coordinator::new(job, self.pool.dispatcher());
        // A spawn failure drops `notify`, which the handle reports as an
        // aborted job.
        let _ = thread::Builder::new()
            .name(format!("mr-coord-{}", handle.job))
            .spawn(move || {
                let result = future::block_on(coordinator.run());
                let _ = notify.send(result);
            });
        handle
    }

    /// Waits for the workers to finish their current tasks and stops them.
    /// Jobs still in flight resolve with an error.
    pub fn shutdown(self) {
        self.pool.shutdown();
        info!("engine stopped");
    }
}

/// Completion handle of a submitted job.
pub struct JobHandle {
    job: String,
    rx: oneshot::Receiver<Result<Vec<PathBuf>>>,
}

impl JobHandle {
    pub fn job_name(&self) -> &str {
        &self.job
    }

    /// Blocks the calling thread until the job is done.
    pub fn wait(self) -> Result<Vec<PathBuf>> {
        future::block_on(self)
    }
}

impl Future for JobHandle {
    type Output = Result<Vec<PathBuf>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(EngineError::JobAborted {
                job: self.job.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Runs a single job on a dedicated engine.
pub struct ParallelMapReduce {
    job: JobSpec,
    config: EngineConfig,
}

impl ParallelMapReduce {
    pub fn new(job: JobSpec, config: EngineConfig) -> Self {
        Self { job, config }
    }
}

#[async_trait]
impl MapReduce for ParallelMapReduce {
    async fn run(self) -> anyhow::Result<Vec<PathBuf>> {
        let name = self.job.name.clone();
        let engine = Engine::start(self.config).context("failed to start worker pool")?;
        let result = engine.submit(self.job).await;
        engine.shutdown();
        result.with_context(|| format!("job {} failed", name))
    }
}
