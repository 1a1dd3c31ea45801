use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use opexec_core::StreamTag;
use runner::{read_index, read_output, CaptureError, OutputCallback, OutputCapture, RunDir};
use tempfile::TempDir;
use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};

fn spawn_sh(script: &str, stderr: Stdio) -> Child {
    Command::new("sh")
        .args(["-c", script])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(stderr)
        .spawn()
        .expect("Failed to spawn sh")
}

async fn capture_script(temp: &TempDir, script: &str) -> RunDir {
    let run_dir = RunDir::new(temp.path());
    run_dir.init().await.unwrap();
    let mut child = spawn_sh(script, Stdio::piped());
    let mut capture = OutputCapture::for_run_dir(&run_dir).quiet(true);
    capture.open(&mut child).await.unwrap();
    capture.wait_and_close().await.unwrap();
    child.wait().await.unwrap();
    run_dir
}

#[tokio::test]
async fn test_lines_from_both_streams() {
    let temp = TempDir::new().unwrap();
    let run_dir = capture_script(&temp, "echo hello; sleep 0.2; echo world >&2").await;

    let raw = std::fs::read(run_dir.output_path()).unwrap();
    assert_eq!(raw, b"hello\nworld\n");

    let records = read_index(&run_dir.index_path()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].stream, StreamTag::Stdout);
    assert_eq!(records[1].stream, StreamTag::Stderr);
    assert!(records[0].time_ms <= records[1].time_ms);

    let lines = read_output(&run_dir).await.unwrap();
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["hello", "world"]);
}

#[tokio::test]
async fn test_index_matches_line_count() {
    let temp = TempDir::new().unwrap();
    let script = r#"
        i=0
        while [ $i -lt 50 ]; do
            echo "out $i"
            echo "err $i" >&2
            printf 'part-'; printf 'ial %s\n' $i
            i=$((i + 1))
        done
    "#;
    let run_dir = capture_script(&temp, script).await;

    let raw = std::fs::read(run_dir.output_path()).unwrap();
    let newlines = raw.iter().filter(|b| **b == b'\n').count();
    assert_eq!(newlines, 150);

    let records = read_index(&run_dir.index_path()).await.unwrap();
    assert_eq!(records.len(), 150);
    let stderr_records = records
        .iter()
        .filter(|r| r.stream == StreamTag::Stderr)
        .count();
    assert_eq!(stderr_records, 50);
}

#[tokio::test]
async fn test_unterminated_last_line_is_indexed() {
    let temp = TempDir::new().unwrap();
    let run_dir = capture_script(&temp, "printf 'one\\ntwo'").await;

    let records = read_index(&run_dir.index_path()).await.unwrap();
    assert_eq!(records.len(), 2);
    let lines = read_output(&run_dir).await.unwrap();
    assert_eq!(lines[1].text, "two");
}

#[tokio::test]
async fn test_control_bytes_kept_in_log_but_not_lines() {
    let temp = TempDir::new().unwrap();
    let lines = Recorded::default();
    let run_dir = RunDir::new(temp.path());
    run_dir.init().await.unwrap();

    let mut child = spawn_sh("printf 'a\\001b\\n'", Stdio::null());
    let mut capture = OutputCapture::for_run_dir(&run_dir)
        .quiet(true)
        .with_callback(lines.clone());
    capture.open(&mut child).await.unwrap();
    capture.wait_and_close().await.unwrap();
    child.wait().await.unwrap();

    assert_eq!(std::fs::read(run_dir.output_path()).unwrap(), b"a\x01b\n");
    assert_eq!(lines.take(), vec![(StreamTag::Stdout, b"ab\n".to_vec())]);
}

#[derive(Clone, Default)]
struct Recorded(Arc<Mutex<Vec<(StreamTag, Vec<u8>)>>>);

impl Recorded {
    fn take(&self) -> Vec<(StreamTag, Vec<u8>)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl OutputCallback for Recorded {
    fn write(&mut self, stream: StreamTag, line: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().push((stream, line.to_vec()));
        Ok(())
    }
}

/// Fails on the second line and counts every call.
#[derive(Clone, Default)]
struct Flaky {
    calls: Arc<Mutex<usize>>,
    closed: Arc<Mutex<bool>>,
}

impl OutputCallback for Flaky {
    fn write(&mut self, _stream: StreamTag, _line: &[u8]) -> io::Result<()> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls == 2 {
            return Err(io::Error::new(io::ErrorKind::Other, "subscriber gone"));
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_callback_is_disabled() {
    let temp = TempDir::new().unwrap();
    let run_dir = RunDir::new(temp.path());
    run_dir.init().await.unwrap();
    let flaky = Flaky::default();

    let mut child = spawn_sh("echo 1; echo 2; echo 3; echo 4", Stdio::null());
    let mut capture = OutputCapture::for_run_dir(&run_dir)
        .quiet(true)
        .with_callback(flaky.clone());
    capture.open(&mut child).await.unwrap();
    capture.wait_and_close().await.unwrap();
    child.wait().await.unwrap();

    // Capture continues; the callback is never called again, nor closed.
    assert_eq!(*flaky.calls.lock().unwrap(), 2);
    assert!(!*flaky.closed.lock().unwrap());
    assert_eq!(read_index(&run_dir.index_path()).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_callback_closed_with_capture() {
    let temp = TempDir::new().unwrap();
    let run_dir = RunDir::new(temp.path());
    run_dir.init().await.unwrap();
    let flaky = Flaky::default();

    let mut child = spawn_sh("echo only", Stdio::null());
    let mut capture = OutputCapture::for_run_dir(&run_dir)
        .quiet(true)
        .with_callback(flaky.clone());
    capture.open(&mut child).await.unwrap();
    capture.wait_and_close().await.unwrap();
    child.wait().await.unwrap();

    assert!(*flaky.closed.lock().unwrap());
}

#[tokio::test]
async fn test_stdout_must_be_piped() {
    let temp = TempDir::new().unwrap();
    let mut child = Command::new("true")
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let mut capture =
        OutputCapture::new(temp.path().join("output"), temp.path().join("output.index"));

    assert!(matches!(
        capture.open(&mut child).await,
        Err(CaptureError::StdoutNotPiped)
    ));
    assert!(!temp.path().join("output").exists());
    child.wait().await.unwrap();
}

/// In-memory mirror destination.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Mirror destination that rejects every write.
struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_mirrors_receive_each_stream() {
    let temp = TempDir::new().unwrap();
    let run_dir = RunDir::new(temp.path());
    run_dir.init().await.unwrap();
    let (out, err) = (SharedBuf::default(), SharedBuf::default());

    let mut child = spawn_sh(
        "echo one; sleep 0.1; echo two >&2; sleep 0.1; printf 'three'",
        Stdio::piped(),
    );
    let mut capture = OutputCapture::for_run_dir(&run_dir).with_mirrors(out.clone(), err.clone());
    capture.open(&mut child).await.unwrap();
    capture.wait_and_close().await.unwrap();
    child.wait().await.unwrap();

    assert_eq!(out.contents(), b"one\nthree");
    assert_eq!(err.contents(), b"two\n");
    assert_eq!(
        std::fs::read(run_dir.output_path()).unwrap(),
        b"one\ntwo\nthree"
    );
}

#[tokio::test]
async fn test_quiet_skips_mirrors() {
    let temp = TempDir::new().unwrap();
    let run_dir = RunDir::new(temp.path());
    run_dir.init().await.unwrap();
    let out = SharedBuf::default();

    let mut child = spawn_sh("echo hidden", Stdio::null());
    let mut capture = OutputCapture::for_run_dir(&run_dir)
        .with_mirrors(out.clone(), SharedBuf::default())
        .quiet(true);
    capture.open(&mut child).await.unwrap();
    capture.wait_and_close().await.unwrap();
    child.wait().await.unwrap();

    assert!(out.contents().is_empty());
    assert_eq!(std::fs::read(run_dir.output_path()).unwrap(), b"hidden\n");
}

#[tokio::test]
async fn test_broken_mirror_keeps_capturing() {
    let temp = TempDir::new().unwrap();
    let run_dir = RunDir::new(temp.path());
    run_dir.init().await.unwrap();

    let mut child = spawn_sh(
        "echo 1; sleep 0.05; echo 2; sleep 0.05; echo 3",
        Stdio::piped(),
    );
    let mut capture = OutputCapture::for_run_dir(&run_dir).with_mirrors(BrokenPipe, BrokenPipe);
    capture.open(&mut child).await.unwrap();
    capture.wait_and_close().await.unwrap();
    child.wait().await.unwrap();

    assert_eq!(std::fs::read(run_dir.output_path()).unwrap(), b"1\n2\n3\n");
    let records = read_index(&run_dir.index_path()).await.unwrap();
    assert_eq!(records.len(), 3);
}
