pub mod common;
pub mod config;
pub mod error;
pub mod map_reduce_apps;
pub mod map_reduce_seq;
pub mod mr_parallel;
pub mod partition;
pub mod store;

pub use common::{JobSpec, KeyValue, MapFn, MapReduce, MapReduceApp, ReduceFn};
pub use config::EngineConfig;
pub use error::EngineError;
pub use map_reduce_seq::SequentialMapReduce;
pub use mr_parallel::{Engine, JobHandle, ParallelMapReduce};
