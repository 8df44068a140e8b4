use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::common::{JobSpec, MapReduce};
use crate::partition::partition;
use crate::store::{atomic_write, output_name};

/// Runs a job on the calling thread with intermediates kept in memory.
///
/// Output files match what the parallel engine writes for the same job, so
/// this doubles as a reference when checking the engine.
pub struct SequentialMapReduce {
    job: JobSpec,
}

impl SequentialMapReduce {
    pub fn new(job: JobSpec) -> Self {
        Self { job }
    }

    pub fn run_sync(self) -> anyhow::Result<Vec<PathBuf>> {
        let job = self.job;
        job.validate()?;
        fs::create_dir_all(&job.data_dir)
            .with_context(|| format!("failed to create {:?}", job.data_dir))?;

        let mut partitions: Vec<BTreeMap<String, Vec<String>>> =
            vec![BTreeMap::new(); job.n_reduce];
        for input in &job.inputs {
            let bytes = fs::read(input).with_context(|| format!("failed to read {:?}", input))?;
            let contents = String::from_utf8(bytes)
                .with_context(|| format!("{:?} is not valid UTF-8", input))?;
            for kv in (job.map_fn)(&input.to_string_lossy(), &contents) {
                partitions[partition(&kv.key, job.n_reduce)]
                    .entry(kv.key)
                    .or_default()
                    .push(kv.value);
            }
        }

        let mut outputs = Vec::with_capacity(job.n_reduce);
        for (reduce_index, grouped) in partitions.into_iter().enumerate() {
            let output = grouped
                .iter()
                .fold(String::new(), |mut acc, (key, values)| {
                    acc.push_str(&(job.reduce_fn)(key, values));
                    acc
                });
            let path = output_name(&job.data_dir, &job.name, reduce_index);
            atomic_write(&path, output.as_bytes())
                .with_context(|| format!("failed to write {:?}", path))?;
            outputs.push(path);
        }

        info!(job = %job.name, outputs = outputs.len(), "sequential job finished");
        Ok(outputs)
    }
}

#[async_trait]
impl MapReduce for SequentialMapReduce {
    async fn run(self) -> anyhow::Result<Vec<PathBuf>> {
        self.run_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_reduce_apps::{parse_counts, WordCount};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_word_count_across_partitions() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "The cat").unwrap();
        fs::write(&b, "the dog").unwrap();

        let job = JobSpec::from_app("seq", dir.path(), vec![a, b], 3, Arc::new(WordCount));
        let outputs = SequentialMapReduce::new(job).run_sync().unwrap();
        assert_eq!(outputs.len(), 3);

        let mut text = String::new();
        for path in &outputs {
            text.push_str(&fs::read_to_string(path).unwrap());
        }
        let counts = parse_counts(&text).unwrap();
        assert_eq!(counts.len(), 3);
        assert_eq!(counts["the"], 2);
        assert_eq!(counts["cat"], 1);
        assert_eq!(counts["dog"], 1);
    }

    #[test]
    fn test_rejects_non_utf8_input() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.bin");
        fs::write(&input, b"ab\xffcd ok").unwrap();

        let job = JobSpec::from_app("seq", dir.path(), vec![input], 1, Arc::new(WordCount));
        assert!(SequentialMapReduce::new(job).run_sync().is_err());
        assert!(!output_name(dir.path(), "seq", 0).exists());
    }

    #[test]
    fn test_rejects_zero_partitions() {
        let dir = TempDir::new().unwrap();
        let job = JobSpec::from_app("seq", dir.path(), vec![], 0, Arc::new(WordCount));
        assert!(SequentialMapReduce::new(job).run_sync().is_err());
    }
}
