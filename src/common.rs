use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// One record flowing from a map function to a reduce function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// (filename, contents) -> records
pub type MapFn = Arc<dyn Fn(&str, &str) -> Vec<KeyValue> + Send + Sync>;
/// (key, values) -> output chunk appended to the partition's output file
pub type ReduceFn = Arc<dyn Fn(&str, &[String]) -> String + Send + Sync>;

pub trait MapReduceApp: Send + Sync {
    fn map(&self, filename: &str, contents: &str) -> Vec<KeyValue>;
    fn reduce(&self, key: &str, values: &[String]) -> String;
}

#[async_trait]
pub trait MapReduce {
    async fn run(self) -> anyhow::Result<Vec<PathBuf>>;
}

/// A job as submitted by the caller. `inputs.len()` is the number of map tasks.
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub data_dir: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub n_reduce: usize,
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        inputs: Vec<PathBuf>,
        n_reduce: usize,
        map_fn: MapFn,
        reduce_fn: ReduceFn,
    ) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            inputs,
            n_reduce,
            map_fn,
            reduce_fn,
        }
    }

    pub fn from_app(
        name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        inputs: Vec<PathBuf>,
        n_reduce: usize,
        app: Arc<dyn MapReduceApp>,
    ) -> Self {
        let map_app = Arc::clone(&app);
        let map_fn: MapFn = Arc::new(move |filename: &str, contents: &str| {
            map_app.map(filename, contents)
        });
        let reduce_fn: ReduceFn =
            Arc::new(move |key: &str, values: &[String]| app.reduce(key, values));
        Self::new(name, data_dir, inputs, n_reduce, map_fn, reduce_fn)
    }

    /// Job names end up in file names, so two jobs sharing a data directory
    /// must never pick the same one.
    pub fn unique_name(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4().simple())
    }

    pub fn n_map(&self) -> usize {
        self.inputs.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_reduce == 0 {
            return Err(EngineError::InvalidJob(format!(
                "job {} needs at least one reduce partition",
                self.name
            )));
        }
        let unusable = |c: char| matches!(c, '/' | '\\' | '\0');
        if self.name.is_empty() || self.name.contains(unusable) {
            return Err(EngineError::InvalidJob(format!(
                "job name {:?} is not usable in a file name",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Map,
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => f.write_str("map"),
            Phase::Reduce => f.write_str("reduce"),
        }
    }
}

pub enum TaskKind {
    Map {
        input: PathBuf,
        n_reduce: usize,
        map_fn: MapFn,
    },
    Reduce {
        n_map: usize,
        reduce_fn: ReduceFn,
    },
}

/// A unit of work handed to the pool. Dropping a task without calling
/// [`Task::finish`] makes its [`Completion`] resolve to `TaskAborted`.
pub struct Task {
    pub job_name: String,
    pub data_dir: PathBuf,
    pub index: usize,
    pub kind: TaskKind,
    done: oneshot::Sender<Result<()>>,
}

impl Task {
    pub fn new(job: &JobSpec, index: usize, kind: TaskKind) -> (Task, Completion) {
        let (done, rx) = oneshot::channel();
        let task = Task {
            job_name: job.name.clone(),
            data_dir: job.data_dir.clone(),
            index,
            kind,
            done,
        };
        let completion = Completion {
            phase: task.phase(),
            index,
            rx,
        };
        (task, completion)
    }

    pub fn map(job: &JobSpec, index: usize) -> (Task, Completion) {
        let kind = TaskKind::Map {
            input: job.inputs[index].clone(),
            n_reduce: job.n_reduce,
            map_fn: Arc::clone(&job.map_fn),
        };
        Task::new(job, index, kind)
    }

    pub fn reduce(job: &JobSpec, index: usize) -> (Task, Completion) {
        let kind = TaskKind::Reduce {
            n_map: job.n_map(),
            reduce_fn: Arc::clone(&job.reduce_fn),
        };
        Task::new(job, index, kind)
    }

    pub fn phase(&self) -> Phase {
        match self.kind {
            TaskKind::Map { .. } => Phase::Map,
            TaskKind::Reduce { .. } => Phase::Reduce,
        }
    }

    /// Fires the completion signal. Consumes the task, so it fires once.
    pub fn finish(self, result: Result<()>) {
        // the coordinator may already be gone if its job was abandoned
        let _ = self.done.send(result);
    }
}

/// The coordinator's side of a task's one-shot completion signal.
pub struct Completion {
    phase: Phase,
    index: usize,
    rx: oneshot::Receiver<Result<()>>,
}

impl Completion {
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(EngineError::TaskAborted {
                phase: self.phase,
                index: self.index,
            }),
        }
    }
}
