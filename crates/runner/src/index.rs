//! Reading captured output back.

use std::io;
use std::path::Path;

use opexec_core::{OutputRecord, StreamTag, RECORD_LEN};
use serde::Serialize;
use tokio::fs;

use crate::error::{Result, RunnerError};
use crate::run_dir::RunDir;

/// One captured line with the time it completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub time_ms: u64,
    pub stream: StreamTag,
    pub text: String,
}

/// Reads every record from an index file.
///
/// A trailing partial record or an unknown stream tag is reported as
/// `InvalidData`.
pub async fn read_index(path: &Path) -> Result<Vec<OutputRecord>> {
    let bytes = fs::read(path).await?;
    if bytes.len() % RECORD_LEN != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{}: {} trailing bytes after last record",
                path.display(),
                bytes.len() % RECORD_LEN
            ),
        )
        .into());
    }
    bytes
        .chunks_exact(RECORD_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            let mut buf = [0u8; RECORD_LEN];
            buf.copy_from_slice(chunk);
            OutputRecord::decode(&buf).ok_or_else(|| {
                RunnerError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: unknown stream tag in record {}", path.display(), i),
                ))
            })
        })
        .collect()
}

/// Pairs the lines of a run's output log with their index records.
///
/// Lines are taken from the raw log in order, with control bytes removed.
/// Output that ends with no index record left to pair is dropped.
pub async fn read_output(run_dir: &RunDir) -> Result<Vec<OutputLine>> {
    let records = read_index(&run_dir.index_path()).await?;
    let raw = fs::read(run_dir.output_path()).await?;

    let mut segments: Vec<&[u8]> = raw.split(|b| *b == b'\n').collect();
    if segments.last().is_some_and(|last| last.is_empty()) {
        segments.pop();
    }

    Ok(segments
        .into_iter()
        .zip(records)
        .map(|(segment, record)| {
            let printable: Vec<u8> = segment.iter().copied().filter(|b| *b >= 9).collect();
            OutputLine {
                time_ms: record.time_ms,
                stream: record.stream,
                text: String::from_utf8_lossy(&printable).into_owned(),
            }
        })
        .collect())
}
