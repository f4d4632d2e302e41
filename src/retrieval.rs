use std::fmt;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::archive::{ArchiveClient, DownloadBody, DownloadResponse};
use crate::checksum::{Checksum, file_digest, verify_file};
use crate::error::MosaicError;

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub uri: String,
    pub destination: Utf8PathBuf,
    pub expected_size: Option<u64>,
    pub checksum: Checksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalPolicy {
    pub poll_tick: Duration,
    pub ticks_per_envelope: u32,
    pub max_attempts: u32,
    pub chunk_size: usize,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self {
            poll_tick: Duration::from_secs(60),
            ticks_per_envelope: 10,
            max_attempts: 2,
            chunk_size: 64 * 1024,
        }
    }
}

pub trait Pause: Send + Sync {
    fn pause(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), MosaicError> {
        if self.is_cancelled() {
            return Err(MosaicError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalState {
    Requested,
    Offline,
    Polling { envelope: u32, tick: u32 },
    Streaming,
    Verifying,
    Complete,
    RetryPending,
    Failed,
}

impl fmt::Display for RetrievalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalState::Requested => write!(f, "requested"),
            RetrievalState::Offline => write!(f, "offline"),
            RetrievalState::Polling { envelope, tick } => write!(f, "polling {envelope}.{tick}"),
            RetrievalState::Streaming => write!(f, "streaming"),
            RetrievalState::Verifying => write!(f, "verifying"),
            RetrievalState::Complete => write!(f, "complete"),
            RetrievalState::RetryPending => write!(f, "retry pending"),
            RetrievalState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalReport {
    pub path: Utf8PathBuf,
    pub attempts: u32,
    pub transferred: bool,
    pub bytes: u64,
}

pub struct RetrievalController<'a, C: ArchiveClient + ?Sized> {
    client: &'a C,
    policy: RetrievalPolicy,
    pause: &'a dyn Pause,
    cancellation: Cancellation,
}

impl<'a, C: ArchiveClient + ?Sized> RetrievalController<'a, C> {
    pub fn new(
        client: &'a C,
        policy: RetrievalPolicy,
        pause: &'a dyn Pause,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            client,
            policy,
            pause,
            cancellation,
        }
    }

    pub fn retrieve(
        &self,
        task: &DownloadTask,
        sink: &dyn ProgressSink,
    ) -> Result<RetrievalReport, MosaicError> {
        let destination = task.destination.as_std_path();
        if verify_file(destination, &task.checksum)? {
            info!(path = %task.destination, "already present with matching checksum");
            let bytes = fs::metadata(destination)
                .map(|meta| meta.len())
                .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
            return Ok(RetrievalReport {
                path: task.destination.clone(),
                attempts: 0,
                transferred: false,
                bytes,
            });
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut actual = String::new();
        for attempt in 1..=max_attempts {
            self.enter(task, RetrievalState::Requested);
            let start = Instant::now();
            let body = match self.open_ready(task, sink) {
                Ok(body) => body,
                Err(err) => return Err(self.fail(task, err)),
            };

            self.enter(task, RetrievalState::Streaming);
            let bytes = match self.stream(task, body, sink) {
                Ok(bytes) => bytes,
                Err(err) => return Err(self.fail(task, err)),
            };

            self.enter(task, RetrievalState::Verifying);
            actual = file_digest(destination, task.checksum.algorithm)?;
            if task.checksum.matches(&actual) {
                self.enter(task, RetrievalState::Complete);
                sink.event(ProgressEvent::done(
                    format!("{} verified", file_label(task)),
                    start.elapsed(),
                ));
                return Ok(RetrievalReport {
                    path: task.destination.clone(),
                    attempts: attempt,
                    transferred: true,
                    bytes,
                });
            }

            warn!(
                path = %task.destination,
                attempt,
                expected = %task.checksum.value,
                actual = %actual,
                "checksum mismatch"
            );
            sink.event(ProgressEvent::message(format!(
                "{}: integrity fault (attempt {attempt}/{max_attempts})",
                file_label(task)
            )));
            fs::remove_file(destination).map_err(|err| {
                MosaicError::Filesystem(format!("remove {}: {err}", task.destination))
            })?;
            if attempt < max_attempts {
                self.enter(task, RetrievalState::RetryPending);
            }
        }

        Err(self.fail(
            task,
            MosaicError::Integrity {
                path: task.destination.to_string(),
                expected: task.checksum.value.clone(),
                actual,
                attempts: max_attempts,
            },
        ))
    }

    fn enter(&self, task: &DownloadTask, state: RetrievalState) {
        debug!(uri = %task.uri, state = %state, "retrieval state");
    }

    fn fail(&self, task: &DownloadTask, err: MosaicError) -> MosaicError {
        self.enter(task, RetrievalState::Failed);
        err
    }

    fn open_ready(
        &self,
        task: &DownloadTask,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadBody, MosaicError> {
        self.cancellation.check()?;
        let mut response = self.client.open_download(&task.uri)?;
        let mut envelope = 0u32;
        loop {
            if let DownloadResponse::Ready(body) = response {
                return Ok(body);
            }
            envelope += 1;
            self.enter(task, RetrievalState::Offline);
            info!(uri = %task.uri, envelope, "product offline, waiting for staging");
            sink.event(ProgressEvent::message(format!(
                "{}: offline, polling every {}s",
                file_label(task),
                self.policy.poll_tick.as_secs()
            )));

            let ticks = self.policy.ticks_per_envelope.max(1);
            let mut tick = 0;
            response = loop {
                tick += 1;
                self.cancellation.check()?;
                self.enter(task, RetrievalState::Polling { envelope, tick });
                self.pause.pause(self.policy.poll_tick);
                self.cancellation.check()?;
                let next = self.client.open_download(&task.uri)?;
                if matches!(next, DownloadResponse::Ready(_)) || tick >= ticks {
                    break next;
                }
            };
        }
    }

    fn stream(
        &self,
        task: &DownloadTask,
        mut body: DownloadBody,
        sink: &dyn ProgressSink,
    ) -> Result<u64, MosaicError> {
        let parent = task
            .destination
            .parent()
            .ok_or_else(|| MosaicError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        // Dropped (and deleted) on any early return.
        let mut temp = tempfile::Builder::new()
            .prefix(".s2m-")
            .suffix(".part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;

        let expected = task
            .expected_size
            .or(body.content_length)
            .filter(|size| *size > 0);
        let label = file_label(task);
        let mut buffer = vec![0u8; self.policy.chunk_size.max(1)];
        let mut total = 0u64;
        let mut reported: Option<u8> = None;
        loop {
            self.cancellation.check()?;
            let read = match body.reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(MosaicError::Transport(err.to_string())),
            };
            temp.write_all(&buffer[..read])
                .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
            total += read as u64;

            if let Some(expected) = expected {
                let percent = (total.saturating_mul(100) / expected).min(100) as u8;
                if reported.is_none_or(|last| percent > last) {
                    reported = Some(percent);
                    sink.event(ProgressEvent::percent(label.clone(), percent));
                }
            }
        }

        temp.flush()
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        temp.persist(task.destination.as_std_path())
            .map_err(|err| MosaicError::Filesystem(err.to_string()))?;
        debug!(path = %task.destination, bytes = total, "stream persisted");
        Ok(total)
    }
}

fn file_label(task: &DownloadTask) -> String {
    task.destination
        .file_name()
        .unwrap_or(task.destination.as_str())
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::checksum::ChecksumAlgorithm;
    use crate::query::QueryParameters;

    const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";

    enum Reply {
        Offline,
        Body(Vec<u8>),
        Stream(Box<dyn Read + Send>),
    }

    #[derive(Default)]
    struct ScriptedArchive {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<usize>,
    }

    impl ScriptedArchive {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(0),
            }
        }

        fn requests(&self) -> usize {
            *self.requests.lock().unwrap()
        }
    }

    impl ArchiveClient for ScriptedArchive {
        fn search(&self, _params: &QueryParameters) -> Result<String, MosaicError> {
            unreachable!()
        }

        fn fetch_text(&self, _uri: &str) -> Result<String, MosaicError> {
            unreachable!()
        }

        fn open_download(&self, _uri: &str) -> Result<DownloadResponse, MosaicError> {
            *self.requests.lock().unwrap() += 1;
            match self.replies.lock().unwrap().pop_front() {
                Some(Reply::Offline) => Ok(DownloadResponse::Offline),
                Some(Reply::Body(bytes)) => Ok(DownloadResponse::Ready(DownloadBody {
                    content_length: Some(bytes.len() as u64),
                    reader: Box::new(Cursor::new(bytes)),
                })),
                Some(Reply::Stream(reader)) => Ok(DownloadResponse::Ready(DownloadBody {
                    content_length: None,
                    reader,
                })),
                None => Err(MosaicError::Status {
                    status: 500,
                    message: "script exhausted".to_string(),
                }),
            }
        }
    }

    struct CancelAfterFirstRead {
        inner: Cursor<Vec<u8>>,
        cancellation: Cancellation,
    }

    impl Read for CancelAfterFirstRead {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let read = self.inner.read(buf)?;
            self.cancellation.cancel();
            Ok(read)
        }
    }

    #[derive(Default)]
    struct CountingPause(Mutex<u32>);

    impl Pause for CountingPause {
        fn pause(&self, _duration: Duration) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Recorder {
        fn event(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn task(dir: &tempfile::TempDir) -> DownloadTask {
        DownloadTask {
            uri: "https://archive.example/band/$value".to_string(),
            destination: Utf8PathBuf::from_path_buf(dir.path().join("band.jp2")).unwrap(),
            expected_size: Some(3),
            checksum: Checksum::new(ChecksumAlgorithm::Md5, ABC_MD5),
        }
    }

    #[test]
    fn streams_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ScriptedArchive::new(vec![Reply::Body(b"abc".to_vec())]);
        let pause = CountingPause::default();
        let controller =
            RetrievalController::new(&archive, RetrievalPolicy::default(), &pause, Cancellation::new());

        let report = controller.retrieve(&task(&dir), &Recorder::default()).unwrap();
        assert!(report.transferred);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.bytes, 3);
        assert_eq!(fs::read(dir.path().join("band.jp2")).unwrap(), b"abc");
    }

    #[test]
    fn valid_existing_file_skips_request() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("band.jp2"), b"abc").unwrap();
        let archive = ScriptedArchive::new(vec![]);
        let pause = CountingPause::default();
        let controller =
            RetrievalController::new(&archive, RetrievalPolicy::default(), &pause, Cancellation::new());

        let report = controller.retrieve(&task(&dir), &Recorder::default()).unwrap();
        assert!(!report.transferred);
        assert_eq!(report.attempts, 0);
        assert_eq!(archive.requests(), 0);
    }

    #[test]
    fn mismatch_retries_then_fails_with_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ScriptedArchive::new(vec![
            Reply::Body(b"xyz".to_vec()),
            Reply::Body(b"xyz".to_vec()),
            Reply::Body(b"abc".to_vec()),
        ]);
        let pause = CountingPause::default();
        let controller =
            RetrievalController::new(&archive, RetrievalPolicy::default(), &pause, Cancellation::new());

        let err = controller.retrieve(&task(&dir), &Recorder::default()).unwrap_err();
        assert_matches!(err, MosaicError::Integrity { attempts: 2, .. });
        assert_eq!(archive.requests(), 2);
        assert!(!dir.path().join("band.jp2").exists());
    }

    #[test]
    fn mismatch_then_match_completes_on_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ScriptedArchive::new(vec![
            Reply::Body(b"xyz".to_vec()),
            Reply::Body(b"abc".to_vec()),
        ]);
        let pause = CountingPause::default();
        let controller =
            RetrievalController::new(&archive, RetrievalPolicy::default(), &pause, Cancellation::new());

        let report = controller.retrieve(&task(&dir), &Recorder::default()).unwrap();
        assert_eq!(report.attempts, 2);
    }

    #[test]
    fn offline_polls_once_per_tick_across_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let mut replies: Vec<Reply> = (0..5).map(|_| Reply::Offline).collect();
        replies.push(Reply::Body(b"abc".to_vec()));
        let archive = ScriptedArchive::new(replies);
        let pause = CountingPause::default();
        let policy = RetrievalPolicy {
            ticks_per_envelope: 2,
            ..RetrievalPolicy::default()
        };
        let controller = RetrievalController::new(&archive, policy, &pause, Cancellation::new());
        let recorder = Recorder::default();

        controller.retrieve(&task(&dir), &recorder).unwrap();
        assert_eq!(*pause.0.lock().unwrap(), 5);
        assert_eq!(archive.requests(), 6);
        let notices = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.message.contains("offline"))
            .count();
        // Envelopes: initial offline, then after ticks 2 and 4.
        assert_eq!(notices, 3);
    }

    #[test]
    fn cancellation_stops_polling() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ScriptedArchive::new(vec![Reply::Offline]);
        let pause = CountingPause::default();
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let controller =
            RetrievalController::new(&archive, RetrievalPolicy::default(), &pause, cancellation);

        let err = controller.retrieve(&task(&dir), &Recorder::default()).unwrap_err();
        assert_matches!(err, MosaicError::Cancelled);
        assert_eq!(archive.requests(), 0);
        assert!(!dir.path().join("band.jp2").exists());
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![7u8; 1000];
        let archive = ScriptedArchive::new(vec![Reply::Body(payload)]);
        let pause = CountingPause::default();
        let policy = RetrievalPolicy {
            chunk_size: 7,
            ..RetrievalPolicy::default()
        };
        let controller = RetrievalController::new(&archive, policy, &pause, Cancellation::new());
        let mut task = task(&dir);
        // Declared size smaller than the body: percentages must still stop at 100.
        task.expected_size = Some(500);
        let recorder = Recorder::default();

        let _ = controller.retrieve(&task, &recorder);
        let percents: Vec<u8> = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| event.percent)
            .collect();
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(percents.last(), Some(&100));
    }

    #[test]
    fn stale_destination_is_redownloaded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("band.jp2"), b"ab").unwrap();
        let archive = ScriptedArchive::new(vec![Reply::Body(b"abc".to_vec())]);
        let pause = CountingPause::default();
        let controller =
            RetrievalController::new(&archive, RetrievalPolicy::default(), &pause, Cancellation::new());

        let report = controller.retrieve(&task(&dir), &Recorder::default()).unwrap();
        assert!(report.transferred);
        assert_eq!(report.attempts, 1);
        assert_eq!(archive.requests(), 1);
        assert_eq!(fs::read(dir.path().join("band.jp2")).unwrap(), b"abc");
    }

    #[test]
    fn cancel_between_chunks_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cancellation = Cancellation::new();
        let reader = CancelAfterFirstRead {
            inner: Cursor::new(b"abcdef".to_vec()),
            cancellation: cancellation.clone(),
        };
        let archive = ScriptedArchive::new(vec![Reply::Stream(Box::new(reader))]);
        let pause = CountingPause::default();
        let policy = RetrievalPolicy {
            chunk_size: 2,
            ..RetrievalPolicy::default()
        };
        let controller = RetrievalController::new(&archive, policy, &pause, cancellation);

        let err = controller.retrieve(&task(&dir), &Recorder::default()).unwrap_err();
        assert_matches!(err, MosaicError::Cancelled);
        assert_eq!(archive.requests(), 1);
        assert!(!dir.path().join("band.jp2").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
