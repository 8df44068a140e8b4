//! File protocol between map tasks, reduce tasks and the job's caller.
//!
//! Intermediate files live at `{data_dir}/mrtmp.{job}-{map}-{reduce}` and hold
//! one JSON-encoded [`KeyValue`] per line. Output files live at
//! `{data_dir}/mrtmp.{job}-res-{reduce}`. Both are published with
//! [`atomic_write`], so readers see either nothing or the whole file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::common::KeyValue;
use crate::error::{EngineError, Result};

pub fn intermediate_name(
    data_dir: &Path,
    job_name: &str,
    map_index: usize,
    reduce_index: usize,
) -> PathBuf {
    data_dir.join(format!("mrtmp.{}-{}-{}", job_name, map_index, reduce_index))
}

pub fn output_name(data_dir: &Path, job_name: &str, reduce_index: usize) -> PathBuf {
    data_dir.join(format!("mrtmp.{}-res-{}", job_name, reduce_index))
}

pub fn encode_records(records: &[KeyValue]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for kv in records {
        serde_json::to_writer(&mut buf, kv).map_err(|source| EngineError::Encode { source })?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// `path` is only used to label errors.
pub fn decode_records(path: &Path, bytes: &[u8]) -> Result<Vec<KeyValue>> {
    bytes
        .split(|b| *b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
        .map(|(i, line)| {
            serde_json::from_slice(line).map_err(|source| EngineError::Codec {
                path: path.to_path_buf(),
                line: i + 1,
                source,
            })
        })
        .collect()
}

pub fn read_intermediate(path: &Path) -> Result<Vec<KeyValue>> {
    let bytes = fs::read(path).map_err(|source| EngineError::IntermediateIo {
        path: path.to_path_buf(),
        source,
    })?;
    decode_records(path, &bytes)
}

/// Stages `contents` in a sibling temp file and renames it over `path`.
///
/// The temp file shares the destination's directory so the rename never
/// crosses a filesystem.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp_path = dir.join(format!(
        ".{}.tmp-{}",
        file_name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));

    let staged = File::create(&temp_path).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    let published = staged.and_then(|()| fs::rename(&temp_path, path));
    if published.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    published
}
