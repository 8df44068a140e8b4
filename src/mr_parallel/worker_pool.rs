use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use async_channel::{Receiver, Sender};
use futures_lite::future;
use tracing::{debug, error, warn};

use crate::common::{KeyValue, MapFn, ReduceFn, Task, TaskKind};
use crate::error::{EngineError, Result};
use crate::partition::partition;
use crate::store::{
    atomic_write, encode_records, intermediate_name, output_name, read_intermediate,
};

/// Fixed set of executor threads fed from one shared handoff queue.
pub struct WorkerPool {
    workers: Vec<Worker>,
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    exit: Sender<()>,
}

impl WorkerPool {
    pub fn start(size: usize) -> io::Result<WorkerPool> {
        assert!(size > 0);

        let (sender, receiver) = async_channel::bounded(size);
        let (exit, exit_signal) = async_channel::bounded(1);
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            workers.push(Worker::new(id, receiver.clone(), exit_signal.clone())?);
        }

        Ok(WorkerPool {
            workers,
            sender,
            receiver,
            exit,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            sender: self.sender.clone(),
        }
    }

    /// Stops every worker once its current task is done and waits for the
    /// threads to exit. Tasks still queued are dropped, which resolves their
    /// completions as aborted.
    pub fn shutdown(self) {
        self.exit.close();
        self.sender.close();

        for worker in self.workers {
            worker.join();
        }

        let mut dropped = 0;
        while let Ok(task) = self.receiver.try_recv() {
            warn!(
                job = %task.job_name,
                phase = %task.phase(),
                index = task.index,
                "dropping task queued at shutdown"
            );
            dropped += 1;
        }
        debug!(dropped, "worker pool stopped");
    }
}

/// Cloneable sending side of the pool's handoff queue.
#[derive(Clone)]
pub struct Dispatcher {
    sender: Sender<Task>,
}

impl Dispatcher {
    /// Resolves once the task is in the queue. With the queue full this waits
    /// for a worker to free a slot.
    pub async fn dispatch(&self, task: Task) -> Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|_| EngineError::PoolClosed)
    }

    pub fn dispatch_blocking(&self, task: Task) -> Result<()> {
        self.sender
            .send_blocking(task)
            .map_err(|_| EngineError::PoolClosed)
    }
}

enum Event {
    Task(Task),
    Exit,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, tasks: Receiver<Task>, exit: Receiver<()>) -> io::Result<Worker> {
        let thread = thread::Builder::new()
            .name(format!("mr-worker-{}", id))
            .spawn(move || loop {
                let event = future::block_on(future::or(
                    async {
                        // only ever closed, never sent to
                        let _ = exit.recv().await;
                        Event::Exit
                    },
                    async {
                        match tasks.recv().await {
                            Ok(task) => Event::Task(task),
                            Err(_) => Event::Exit,
                        }
                    },
                ));
                match event {
                    Event::Task(task) => run_task(id, task),
                    Event::Exit => break,
                }
            })?;

        Ok(Worker {
            id,
            thread: Some(thread),
        })
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker = self.id, "worker thread panicked");
            }
        }
    }
}

fn run_task(worker: usize, task: Task) {
    let started = Instant::now();
    let phase = task.phase();
    debug!(worker, job = %task.job_name, %phase, index = task.index, "task started");

    let result = match panic::catch_unwind(AssertUnwindSafe(|| execute(&task))) {
        Ok(result) => result,
        Err(_) => Err(EngineError::TaskAborted {
            phase,
            index: task.index,
        }),
    };

    match &result {
        Ok(()) => debug!(
            worker,
            job = %task.job_name,
            %phase,
            index = task.index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task finished"
        ),
        Err(err) => error!(
            worker,
            job = %task.job_name,
            %phase,
            index = task.index,
            error = %err,
            "task failed"
        ),
    }
    task.finish(result);
}

fn execute(task: &Task) -> Result<()> {
    match &task.kind {
        TaskKind::Map {
            input,
            n_reduce,
            map_fn,
        } => execute_map(task, input, *n_reduce, map_fn),
        TaskKind::Reduce { n_map, reduce_fn } => execute_reduce(task, *n_map, reduce_fn),
    }
}

fn execute_map(task: &Task, input: &Path, n_reduce: usize, map_fn: &MapFn) -> Result<()> {
    let bytes = fs::read(input).map_err(|source| EngineError::InputIo {
        path: input.to_path_buf(),
        source,
    })?;
    let contents = String::from_utf8(bytes).map_err(|err| EngineError::InputIo {
        path: input.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, err),
    })?;
    let key_values = map_fn(&input.to_string_lossy(), &contents);

    let mut buckets: Vec<Vec<KeyValue>> = vec![Vec::new(); n_reduce];
    for kv in key_values {
        buckets[partition(&kv.key, n_reduce)].push(kv);
    }

    // Every bucket is written, empty ones included: the reducer expects
    // exactly one file per map task.
    let data_dir = task.data_dir.as_path();
    let job_name = task.job_name.as_str();
    let map_index = task.index;
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let writers: Vec<_> = buckets
            .iter()
            .enumerate()
            .map(|(reduce_index, bucket)| {
                scope.spawn(move || -> Result<()> {
                    let path = intermediate_name(data_dir, job_name, map_index, reduce_index);
                    let encoded = encode_records(bucket)?;
                    atomic_write(&path, &encoded)
                        .map_err(|source| EngineError::IntermediateIo { path, source })
                })
            })
            .collect();
        writers
            .into_iter()
            .map(|writer| {
                writer.join().unwrap_or_else(|_| {
                    Err(EngineError::TaskAborted {
                        phase: task.phase(),
                        index: map_index,
                    })
                })
            })
            .collect()
    });

    results.into_iter().collect()
}

fn execute_reduce(task: &Task, n_map: usize, reduce_fn: &ReduceFn) -> Result<()> {
    // Keys come out in byte order, values in (map index, file position) order.
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for map_index in 0..n_map {
        let path = intermediate_name(&task.data_dir, &task.job_name, map_index, task.index);
        for kv in read_intermediate(&path)? {
            grouped.entry(kv.key).or_default().push(kv.value);
        }
    }

    let mut output = String::new();
    for (key, values) in &grouped {
        output.push_str(&reduce_fn(key, values));
    }

    let path = output_name(&task.data_dir, &task.job_name, task.index);
    atomic_write(&path, output.as_bytes())
        .map_err(|source| EngineError::OutputIo { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::JobSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    fn word_job(dir: &Path, inputs: Vec<std::path::PathBuf>, n_reduce: usize) -> JobSpec {
        JobSpec::new(
            "pool",
            dir,
            inputs,
            n_reduce,
            Arc::new(|_: &str, contents: &str| {
                contents
                    .split_whitespace()
                    .map(|w| KeyValue::new(w, "1"))
                    .collect()
            }),
            Arc::new(|key: &str, values: &[String]| format!("{}:{}\n", key, values.len())),
        )
    }

    #[test]
    fn test_map_task_writes_every_partition() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "the cat the").unwrap();
        let job = word_job(dir.path(), vec![input], 4);

        let pool = WorkerPool::start(2).unwrap();
        let (task, done) = Task::map(&job, 0);
        pool.dispatcher().dispatch_blocking(task).unwrap();
        future::block_on(done.wait()).unwrap();
        pool.shutdown();

        let mut total = Vec::new();
        for reduce_index in 0..4 {
            let path = intermediate_name(dir.path(), "pool", 0, reduce_index);
            for kv in read_intermediate(&path).unwrap() {
                assert_eq!(partition(&kv.key, 4), reduce_index);
                total.push(kv.key);
            }
        }
        total.sort();
        assert_eq!(total, vec!["cat", "the", "the"]);
    }

    #[test]
    fn test_reduce_task_orders_keys_and_values() {
        let dir = TempDir::new().unwrap();
        for (map_index, records) in [
            vec![KeyValue::new("b", "m0"), KeyValue::new("a", "m0")],
            vec![KeyValue::new("a", "m1"), KeyValue::new("b", "m1")],
        ]
        .iter()
        .enumerate()
        {
            let path = intermediate_name(dir.path(), "pool", map_index, 0);
            atomic_write(&path, &encode_records(records).unwrap()).unwrap();
        }
        let mut job = word_job(dir.path(), vec!["x".into(), "y".into()], 1);
        job.reduce_fn =
            Arc::new(|key: &str, values: &[String]| format!("{}={}\n", key, values.join(",")));

        let pool = WorkerPool::start(1).unwrap();
        let (task, done) = Task::reduce(&job, 0);
        pool.dispatcher().dispatch_blocking(task).unwrap();
        future::block_on(done.wait()).unwrap();
        pool.shutdown();

        let output = fs::read_to_string(output_name(dir.path(), "pool", 0)).unwrap();
        assert_eq!(output, "a=m0,m1\nb=m0,m1\n");
    }

    #[test]
    fn test_missing_input_fails_the_task() {
        let dir = TempDir::new().unwrap();
        let job = word_job(dir.path(), vec![dir.path().join("nope")], 1);
        let pool = WorkerPool::start(1).unwrap();
        let (task, done) = Task::map(&job, 0);
        pool.dispatcher().dispatch_blocking(task).unwrap();
        assert!(matches!(
            future::block_on(done.wait()),
            Err(EngineError::InputIo { .. })
        ));
        pool.shutdown();
    }

    #[test]
    fn test_non_utf8_input_fails_the_task() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.bin");
        fs::write(&input, b"ab\xffcd ok").unwrap();
        let job = word_job(dir.path(), vec![input.clone()], 1);

        let pool = WorkerPool::start(1).unwrap();
        let (task, done) = Task::map(&job, 0);
        pool.dispatcher().dispatch_blocking(task).unwrap();
        match future::block_on(done.wait()) {
            Err(EngineError::InputIo { path, source }) => {
                assert_eq!(path, input);
                assert_eq!(source.kind(), io::ErrorKind::InvalidData);
            }
            other => panic!("expected an input error, got {:?}", other),
        }
        pool.shutdown();

        assert!(!intermediate_name(dir.path(), "pool", 0, 0).exists());
    }

    #[test]
    fn test_panicking_map_fn_is_reported_and_worker_survives() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "boom").unwrap();
        let mut job = word_job(dir.path(), vec![input.clone(), input], 1);
        job.map_fn = Arc::new(|_: &str, _: &str| -> Vec<KeyValue> { panic!("map blew up") });

        let pool = WorkerPool::start(1).unwrap();
        for index in 0..2 {
            let (task, done) = Task::map(&job, index);
            pool.dispatcher().dispatch_blocking(task).unwrap();
            assert!(matches!(
                future::block_on(done.wait()),
                Err(EngineError::TaskAborted { index: i, .. }) if i == index
            ));
        }
        pool.shutdown();
    }

    #[test]
    fn test_concurrency_is_bounded_by_pool_size() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "x").unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(Mutex::new(0usize));
        let mut job = word_job(dir.path(), vec![input; 12], 1);
        job.map_fn = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Arc::new(move |_: &str, _: &str| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                {
                    let mut peak = peak.lock().unwrap();
                    *peak = (*peak).max(now);
                }
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Vec::new()
            })
        };

        let pool = WorkerPool::start(3).unwrap();
        let dispatcher = pool.dispatcher();
        let mut completions = Vec::new();
        for index in 0..12 {
            let (task, done) = Task::map(&job, index);
            dispatcher.dispatch_blocking(task).unwrap();
            completions.push(done);
        }
        for done in completions {
            future::block_on(done.wait()).unwrap();
        }
        pool.shutdown();

        let peak = *peak.lock().unwrap();
        assert!(peak >= 1 && peak <= 3, "peak concurrency {}", peak);
    }

    #[test]
    fn test_dispatch_after_shutdown_is_rejected() {
        let dir = TempDir::new().unwrap();
        let job = word_job(dir.path(), vec![dir.path().join("a")], 1);
        let pool = WorkerPool::start(2).unwrap();
        let dispatcher = pool.dispatcher();
        pool.shutdown();

        let (task, done) = Task::map(&job, 0);
        assert!(matches!(
            dispatcher.dispatch_blocking(task),
            Err(EngineError::PoolClosed)
        ));
        assert!(matches!(
            future::block_on(done.wait()),
            Err(EngineError::TaskAborted { .. })
        ));
    }
}
