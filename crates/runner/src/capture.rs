//! Output capture for a running process.
//!
//! One reader task per piped stream copies raw chunks into the output log,
//! mirrors them to this process's own stdout/stderr, and appends an index
//! record for every completed line. All readers share one lock so that a
//! chunk's log write and the index records for the lines it completes are
//! never interleaved with another stream's.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use opexec_core::{OutputRecord, StreamTag};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::DEFAULT_CLOSE_TIMEOUT;
use crate::error::CaptureError;
use crate::run_dir::RunDir;

const READ_SIZE: usize = 4096;

/// Receives every completed output line, trailing newline included, with
/// the stream that produced it.
///
/// An error disables the callback for the rest of the capture.
pub trait OutputCallback: Send {
    fn write(&mut self, stream: StreamTag, line: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type Mirror = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything the readers write to, guarded by one lock.
struct Sinks {
    output: File,
    index: File,
    callback: Option<Box<dyn OutputCallback>>,
}

impl Sinks {
    async fn end_line(&mut self, stream: StreamTag, line: &[u8]) -> io::Result<()> {
        let record = OutputRecord::new(now_ms(), stream);
        self.index.write_all(&record.encode()).await?;
        if let Some(callback) = self.callback.as_mut() {
            if let Err(e) = callback.write(stream, line) {
                error!(error = %e, "Output callback failed; disabling it");
                self.callback = None;
            }
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Open,
    Closed,
}

/// Captures a child's output to a log file and its line index.
///
/// Single use: [`open`](Self::open), then [`wait`](Self::wait), then
/// [`close`](Self::close).
pub struct OutputCapture {
    output_path: PathBuf,
    index_path: PathBuf,
    quiet: bool,
    close_timeout: Duration,
    callback: Option<Box<dyn OutputCallback>>,
    mirrors: Option<(Mirror, Mirror)>,
    phase: Phase,
    sinks: Option<Arc<Mutex<Sinks>>>,
    readers: Vec<JoinHandle<io::Result<()>>>,
}

impl OutputCapture {
    pub fn new(output_path: impl AsRef<Path>, index_path: impl AsRef<Path>) -> Self {
        Self {
            output_path: output_path.as_ref().to_path_buf(),
            index_path: index_path.as_ref().to_path_buf(),
            quiet: false,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            callback: None,
            mirrors: None,
            phase: Phase::Ready,
            sinks: None,
            readers: Vec::new(),
        }
    }

    pub fn for_run_dir(run_dir: &RunDir) -> Self {
        Self::new(run_dir.output_path(), run_dir.index_path())
    }

    /// Don't mirror output to this process's stdout/stderr.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_callback(mut self, callback: impl OutputCallback + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Mirror stdout and stderr to these writers instead of this process's
    /// own streams. Ignored when quiet.
    pub fn with_mirrors<O, E>(mut self, stdout: O, stderr: E) -> Self
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        self.mirrors = Some((Box::new(stdout), Box::new(stderr)));
        self
    }

    /// Upper bound on waiting for the readers' lock in [`close`](Self::close).
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Starts capturing `child`'s output.
    ///
    /// The child's stdout must be piped; stderr is captured when piped too.
    pub async fn open(&mut self, child: &mut Child) -> Result<(), CaptureError> {
        if self.phase != Phase::Ready {
            return Err(CaptureError::AlreadyOpen);
        }
        if child.stdout.is_none() {
            return Err(CaptureError::StdoutNotPiped);
        }

        for path in [&self.output_path, &self.index_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }
        let sinks = Arc::new(Mutex::new(Sinks {
            output: File::create(&self.output_path).await?,
            index: File::create(&self.index_path).await?,
            callback: self.callback.take(),
        }));

        let (stdout_mirror, stderr_mirror) = match self.mirrors.take() {
            _ if self.quiet => (None, None),
            Some((out, err)) => (Some(out), Some(err)),
            None => (
                Some(Box::new(tokio::io::stdout()) as Mirror),
                Some(Box::new(tokio::io::stderr()) as Mirror),
            ),
        };
        if let Some(stdout) = child.stdout.take() {
            self.readers.push(tokio::spawn(read_stream(
                stdout,
                StreamTag::Stdout,
                sinks.clone(),
                stdout_mirror,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(tokio::spawn(read_stream(
                stderr,
                StreamTag::Stderr,
                sinks.clone(),
                stderr_mirror,
            )));
        }

        debug!(
            output = %self.output_path.display(),
            readers = self.readers.len(),
            "Output capture opened"
        );
        self.sinks = Some(sinks);
        self.phase = Phase::Open;
        Ok(())
    }

    /// Waits for every reader to reach end of stream.
    ///
    /// Returns once the child's pipes close; there is no other way to stop
    /// the readers. The first reader error, if any, is returned after all
    /// readers have finished.
    pub async fn wait(&mut self) -> Result<(), CaptureError> {
        if self.phase != Phase::Open {
            return Err(CaptureError::NotOpen);
        }
        let mut first_error = None;
        for reader in self.readers.drain(..) {
            let error = match reader.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => CaptureError::Io(e),
                Err(e) => CaptureError::ReaderFailed(e.to_string()),
            };
            warn!(error = %error, "Output reader stopped early");
            first_error.get_or_insert(error);
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Flushes and closes the log files and the callback.
    ///
    /// Fails with `CloseTimeout` when the lock can't be taken in time and
    /// with `ReadersRunning` when called before the readers finished.
    pub async fn close(&mut self) -> Result<(), CaptureError> {
        if self.phase != Phase::Open {
            return Err(CaptureError::NotOpen);
        }
        let sinks = self.sinks.clone().ok_or(CaptureError::NotOpen)?;
        let mut guard = tokio::time::timeout(self.close_timeout, sinks.lock())
            .await
            .map_err(|_| CaptureError::CloseTimeout(self.close_timeout))?;
        if self.readers.iter().any(|reader| !reader.is_finished()) {
            return Err(CaptureError::ReadersRunning);
        }

        guard.output.flush().await?;
        guard.index.flush().await?;
        if let Some(mut callback) = guard.callback.take() {
            if let Err(e) = callback.close() {
                warn!(error = %e, "Output callback failed to close");
            }
        }
        drop(guard);

        self.readers.clear();
        self.sinks = None;
        self.phase = Phase::Closed;
        debug!(output = %self.output_path.display(), "Output capture closed");
        Ok(())
    }

    pub async fn wait_and_close(&mut self) -> Result<(), CaptureError> {
        let waited = self.wait().await;
        self.close().await?;
        waited
    }
}

async fn read_stream<R>(
    mut source: R,
    stream: StreamTag,
    sinks: Arc<Mutex<Sinks>>,
    mut mirror: Option<Mirror>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_SIZE];
    let mut line = Vec::new();
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];

        let mut guard = sinks.lock().await;
        if let Some(out) = mirror.as_mut() {
            if let Err(e) = write_mirror(out, chunk).await {
                warn!(stream = stream.as_str(), error = %e, "Stopped mirroring output");
                mirror = None;
            }
        }
        guard.output.write_all(chunk).await?;
        for &b in chunk {
            if b < 9 {
                continue;
            }
            line.push(b);
            if b == b'\n' {
                guard.end_line(stream, &line).await?;
                line.clear();
            }
        }
    }

    if !line.is_empty() {
        sinks.lock().await.end_line(stream, &line).await?;
    }
    debug!(stream = stream.as_str(), "Output reader reached end of stream");
    Ok(())
}

async fn write_mirror(out: &mut Mirror, chunk: &[u8]) -> io::Result<()> {
    out.write_all(chunk).await?;
    out.flush().await
}
