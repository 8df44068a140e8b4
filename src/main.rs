use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use mr_cluster::config::default_workers;
use mr_cluster::map_reduce_apps::{parse_counts, UrlCount, WordCount};
use mr_cluster::{
    EngineConfig, JobSpec, MapReduce, MapReduceApp, ParallelMapReduce, SequentialMapReduce,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum App {
    WordCount,
    UrlCount,
}

#[derive(Debug, Parser)]
#[command(name = "mr-cluster", about = "Run a MapReduce job on a local worker pool")]
struct Args {
    /// Input files, one map task per file
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = App::WordCount)]
    app: App,

    /// Directory for intermediate and output files
    #[arg(long, default_value = "output")]
    data_dir: PathBuf,

    /// Defaults to a unique name derived from the app
    #[arg(long)]
    job_name: Option<String>,

    #[arg(long, default_value_t = default_workers())]
    workers: usize,

    /// Number of reduce partitions, defaults to the worker count
    #[arg(long)]
    n_reduce: Option<usize>,

    /// Run on the calling thread instead of the worker pool
    #[arg(long)]
    sequential: bool,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_thread_names(verbose >= 1)
        .init();
}

async fn execute<M: MapReduce>(mr: M) -> anyhow::Result<Vec<PathBuf>> {
    mr.run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    debug!(?args, "parsed arguments");

    let (prefix, app): (&str, Arc<dyn MapReduceApp>) = match args.app {
        App::WordCount => ("wc", Arc::new(WordCount)),
        App::UrlCount => ("urls", Arc::new(UrlCount)),
    };
    let name = args
        .job_name
        .clone()
        .unwrap_or_else(|| JobSpec::unique_name(prefix));
    let config = EngineConfig::default().with_workers(args.workers);
    let n_reduce = args.n_reduce.unwrap_or(config.workers);
    let job = JobSpec::from_app(name, &args.data_dir, args.inputs.clone(), n_reduce, app);

    let outputs = if args.sequential {
        execute(SequentialMapReduce::new(job)).await?
    } else {
        execute(ParallelMapReduce::new(job, config)).await?
    };

    let mut distinct = 0;
    for path in &outputs {
        let text =
            fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
        distinct += parse_counts(&text)?.len();
        println!("{}", path.display());
    }
    info!(outputs = outputs.len(), distinct, "done");

    Ok(())
}
