//! Session supervisor: one cancellable analysis loop per client connection
//!
//! ```text
//!   Idle --start--> Running --cancel--> Cancelling --loop joined--> Idle
//! ```
//!
//! The loop decodes frames, samples every Nth one for analysis and streams the
//! parsed result to the subscriber. Failures are absorbed by kind:
//!
//! - [`AnalysisError`]: no update for this cycle, keep going
//! - [`SendError`]: logged, keep going
//! - [`LoopFault`]: logged, fixed backoff, keep going
//!
//! Only cancellation ends the loop. Every suspension point races the
//! session's [`CancellationToken`], and the frame source is closed on the way
//! out regardless of where the loop was interrupted.

use crate::analyzer::VisionAnalyzer;
use crate::broadcast::{Broadcaster, UpdateSink};
use crate::error::{AnalysisError, LoopFault, OpenError, SendError};
use crate::image::ImageConfig;
use crate::metrics::{MetricsSnapshot, SessionMetrics, Timer};
use crate::parser::{parse_response, AnalysisResult};
use crate::sampler::{should_analyze, DEFAULT_INTERVAL_FRAMES};
use crate::video::{FrameSource, SourceOpener, VideoFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sample_interval_frames: u64,
    /// Cooperative pause after every decoded frame
    pub frame_pause: Duration,
    /// Wait after a [`LoopFault`] before the next iteration
    pub fault_backoff: Duration,
    pub preview: ImageConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_interval_frames: DEFAULT_INTERVAL_FRAMES,
            frame_pause: Duration::from_millis(100),
            fault_backoff: Duration::from_secs(5),
            preview: ImageConfig {
                max_dimension: 1280,
                quality: 85,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Cancelling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { fps: u32 },
    /// A loop is already active; nothing was spawned
    AlreadyRunning,
}

struct LoopHandle {
    video_path: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Session<S> {
    id: Uuid,
    config: SessionConfig,
    opener: Arc<dyn SourceOpener>,
    analyzer: Arc<dyn VisionAnalyzer>,
    broadcaster: Arc<Broadcaster<S>>,
    metrics: Arc<SessionMetrics>,
    state: watch::Sender<SessionState>,
    running: Option<LoopHandle>,
}

impl<S: UpdateSink + 'static> Session<S> {
    pub fn new(
        config: SessionConfig,
        opener: Arc<dyn SourceOpener>,
        analyzer: Arc<dyn VisionAnalyzer>,
        broadcaster: Broadcaster<S>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            id: Uuid::new_v4(),
            config,
            opener,
            analyzer,
            broadcaster: Arc::new(broadcaster),
            metrics: SessionMetrics::new(),
            state,
            running: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn video_path(&self) -> Option<&str> {
        self.running.as_ref().map(|h| h.video_path.as_str())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Open `video_path` and spawn the analysis loop.
    ///
    /// An [`OpenError`] leaves the session Idle. A start while a loop is
    /// active is rejected without touching the running loop.
    pub async fn start(&mut self, video_path: &str) -> Result<StartOutcome, OpenError> {
        self.reap_finished().await;

        if let Some(handle) = &self.running {
            warn!(
                session_id = %self.id,
                active = %handle.video_path,
                requested = %video_path,
                "Analysis already running, ignoring start"
            );
            return Ok(StartOutcome::AlreadyRunning);
        }

        let source = self.opener.open(video_path).await?;
        let fps = source.fps();
        let cancel = CancellationToken::new();
        // Counters describe the current run only
        self.metrics = SessionMetrics::new();

        let worker = LoopWorker {
            session_id: self.id,
            config: self.config.clone(),
            analyzer: Arc::clone(&self.analyzer),
            broadcaster: Arc::clone(&self.broadcaster),
            metrics: Arc::clone(&self.metrics),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run(source));

        self.running = Some(LoopHandle {
            video_path: video_path.to_string(),
            cancel,
            task,
        });
        self.state.send_replace(SessionState::Running);

        info!(
            session_id = %self.id,
            video_path = %video_path,
            fps,
            interval_frames = self.config.sample_interval_frames,
            "Analysis started"
        );

        Ok(StartOutcome::Started { fps })
    }

    /// Signal the loop to stop and wait for it to release its frame source.
    ///
    /// Returns `false` when no loop was running.
    pub async fn cancel(&mut self) -> bool {
        let Some(handle) = self.running.take() else {
            return false;
        };

        self.state.send_replace(SessionState::Cancelling);
        handle.cancel.cancel();
        self.join(handle.task).await;
        self.state.send_replace(SessionState::Idle);

        info!(session_id = %self.id, video_path = %handle.video_path, "Analysis cancelled");
        true
    }

    /// Collect a loop task that ended without being cancelled (panic).
    async fn reap_finished(&mut self) {
        let finished = self.running.as_ref().is_some_and(|h| h.task.is_finished());
        if !finished {
            return;
        }
        if let Some(handle) = self.running.take() {
            self.join(handle.task).await;
            self.state.send_replace(SessionState::Idle);
        }
    }

    async fn join(&self, task: JoinHandle<()>) {
        if let Err(e) = task.await {
            if e.is_panic() {
                error!(session_id = %self.id, error = %e, "Analysis loop panicked");
            } else {
                warn!(session_id = %self.id, error = %e, "Analysis loop aborted");
            }
        }
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        // Can't await here; the loop still closes its source on the way out.
        if let Some(handle) = self.running.take() {
            handle.cancel.cancel();
        }
    }
}

enum Flow {
    Continue,
    Cancelled,
    Fault(LoopFault),
}

/// State moved into the spawned loop task.
struct LoopWorker<S> {
    session_id: Uuid,
    config: SessionConfig,
    analyzer: Arc<dyn VisionAnalyzer>,
    broadcaster: Arc<Broadcaster<S>>,
    metrics: Arc<SessionMetrics>,
    cancel: CancellationToken,
}

impl<S: UpdateSink> LoopWorker<S> {
    async fn run(self, mut source: Box<dyn FrameSource>) {
        debug!(session_id = %self.session_id, "Loop task running");

        loop {
            match self.iteration(source.as_mut()).await {
                Flow::Continue => {}
                Flow::Cancelled => break,
                Flow::Fault(fault) => {
                    self.metrics.record_fault();
                    error!(
                        session_id = %self.session_id,
                        error = %fault,
                        backoff_ms = self.config.fault_backoff.as_millis() as u64,
                        "Error in video processing, backing off"
                    );
                    if self.pause(self.config.fault_backoff).await {
                        break;
                    }
                }
            }
        }

        source.close().await;

        let snapshot = self.metrics.snapshot();
        info!(
            session_id = %self.session_id,
            frames = snapshot.frames_decoded,
            samples = snapshot.samples,
            updates = snapshot.updates_sent,
            analyzer_failures = snapshot.analyzer_failures,
            loop_faults = snapshot.loop_faults,
            "Loop task stopped"
        );
    }

    async fn iteration(&self, source: &mut dyn FrameSource) -> Flow {
        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Flow::Cancelled,
            next = source.next_frame() => next,
        };

        let frame = match next {
            Ok(frame) => frame,
            Err(e) => return Flow::Fault(LoopFault::Decode(e)),
        };
        self.metrics.record_frame(frame.index);

        if should_analyze(frame.index, self.config.sample_interval_frames) {
            match self.process_sample(&frame).await {
                Flow::Continue => {}
                other => return other,
            }
        }

        if self.pause(self.config.frame_pause).await {
            return Flow::Cancelled;
        }
        Flow::Continue
    }

    /// Analyze, parse and broadcast one sampled frame.
    async fn process_sample(&self, frame: &VideoFrame) -> Flow {
        debug!(session_id = %self.session_id, frame_index = frame.index, "Processing frame");

        let timer = Timer::new();
        let analysis = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Flow::Cancelled,
            analysis = self.analyzer.analyze(frame) => analysis,
        };

        let text = match analysis {
            Ok(text) => {
                self.metrics.record_analysis(true, timer.elapsed_ms());
                text
            }
            Err(AnalysisError::Encode(e)) => {
                self.metrics.record_analysis(false, timer.elapsed_ms());
                return Flow::Fault(LoopFault::Encode(e));
            }
            Err(e) => {
                self.metrics.record_analysis(false, timer.elapsed_ms());
                warn!(
                    session_id = %self.session_id,
                    frame_index = frame.index,
                    error = %e,
                    "Analysis failed, skipping update"
                );
                return Flow::Continue;
            }
        };

        let result = AnalysisResult::from_parsed(parse_response(&text), frame.index, frame.fps);
        debug!(
            session_id = %self.session_id,
            frame_index = frame.index,
            available_spaces = result.available_spaces,
            spots = result.recommended_spots.len(),
            "Parsed analysis"
        );

        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Flow::Cancelled,
            sent = self.broadcaster.send(&result, frame) => sent,
        };

        match sent {
            Ok(()) => self.metrics.record_send(true),
            Err(SendError::Encode(e)) => {
                self.metrics.record_send(false);
                return Flow::Fault(LoopFault::Encode(e));
            }
            Err(e) => {
                self.metrics.record_send(false);
                warn!(session_id = %self.session_id, frame_index = frame.index, error = %e, "Failed to send update");
            }
        }

        Flow::Continue
    }

    /// Sleep unless cancelled first. Returns `true` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::FfmpegError;
    use crate::video::MemoryFrameSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Notify};

    const ANSWER: &str = "1. Available spaces: 5\n2. Recommended spots:\n- A1\n- B2";

    struct MemoryOpener {
        frames: usize,
        opens: AtomicUsize,
    }

    impl MemoryOpener {
        fn new(frames: usize) -> Arc<Self> {
            Arc::new(Self { frames, opens: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl SourceOpener for MemoryOpener {
        async fn open(&self, video_path: &str) -> Result<Box<dyn FrameSource>, OpenError> {
            if video_path == "missing.mp4" {
                return Err(OpenError::NotFound(video_path.to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MemoryFrameSource::solid(self.frames, 8, 8, 30)))
        }
    }

    /// Fails the calls whose 0-based number is in `fail_on`.
    struct ScriptedAnalyzer {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    impl ScriptedAnalyzer {
        fn new(fail_on: Vec<usize>) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail_on })
        }
    }

    #[async_trait]
    impl VisionAnalyzer for ScriptedAnalyzer {
        async fn analyze(&self, _frame: &VideoFrame) -> Result<String, AnalysisError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&call) {
                Err(AnalysisError::RateLimited)
            } else {
                Ok(ANSWER.to_string())
            }
        }
    }

    /// Never returns; signals once it has been entered.
    struct StuckAnalyzer {
        entered: Notify,
    }

    #[async_trait]
    impl VisionAnalyzer for StuckAnalyzer {
        async fn analyze(&self, _frame: &VideoFrame) -> Result<String, AnalysisError> {
            self.entered.notify_one();
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Frame source that fails its first `failures` reads.
    struct FlakySource {
        inner: MemoryFrameSource,
        failures: usize,
    }

    #[async_trait]
    impl FrameSource for FlakySource {
        async fn next_frame(&mut self) -> Result<VideoFrame, FfmpegError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(FfmpegError::InvalidOutput("corrupt packet".to_string()));
            }
            self.inner.next_frame().await
        }

        fn fps(&self) -> u32 {
            self.inner.fps()
        }

        async fn close(&mut self) {
            self.inner.close().await;
        }
    }

    struct FlakyOpener;

    #[async_trait]
    impl SourceOpener for FlakyOpener {
        async fn open(&self, _video_path: &str) -> Result<Box<dyn FrameSource>, OpenError> {
            Ok(Box::new(FlakySource { inner: MemoryFrameSource::solid(4, 8, 8, 30), failures: 1 }))
        }
    }

    fn config(interval: u64) -> SessionConfig {
        SessionConfig {
            sample_interval_frames: interval,
            frame_pause: Duration::from_millis(100),
            fault_backoff: Duration::from_secs(5),
            preview: ImageConfig { max_dimension: 0, quality: 70 },
        }
    }

    fn session(
        interval: u64,
        opener: Arc<dyn SourceOpener>,
        analyzer: Arc<dyn VisionAnalyzer>,
    ) -> (Session<mpsc::Sender<String>>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let broadcaster = Broadcaster::new(tx, ImageConfig { max_dimension: 0, quality: 70 });
        (Session::new(config(interval), opener, analyzer, broadcaster), rx)
    }

    async fn next_update(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let text = rx.recv().await.expect("update channel closed");
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_in_frame_order() {
        let (mut session, mut rx) = session(2, MemoryOpener::new(10), ScriptedAnalyzer::new(vec![]));
        let outcome = session.start("lot.mp4").await.unwrap();
        assert_eq!(outcome, StartOutcome::Started { fps: 30 });
        assert_eq!(session.state(), SessionState::Running);

        let mut counts = Vec::new();
        for _ in 0..7 {
            let update = next_update(&mut rx).await;
            assert_eq!(update["type"], "analysis_update");
            assert_eq!(update["available_spaces"], 5);
            assert_eq!(update["recommended_spots"], serde_json::json!(["A1", "B2"]));
            counts.push(update["frame_count"].as_u64().unwrap());
        }
        // 10 frames per pass, sampled every 2nd, wrapping back to 0
        assert_eq!(counts, vec![0, 2, 4, 6, 8, 0, 2]);

        assert!(session.cancel().await);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_analysis_skips_one_cycle() {
        let analyzer = ScriptedAnalyzer::new(vec![0]);
        let (mut session, mut rx) = session(3, MemoryOpener::new(100), analyzer.clone());
        session.start("lot.mp4").await.unwrap();

        let update = next_update(&mut rx).await;
        assert_eq!(update["frame_count"], 3);
        assert_eq!(update["available_spaces"], 5);

        session.cancel().await;
        let metrics = session.metrics();
        assert_eq!(metrics.analyzer_failures, 1);
        assert!(metrics.updates_sent >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let opener = MemoryOpener::new(10);
        let (mut session, _rx) = session(5, opener.clone(), ScriptedAnalyzer::new(vec![]));

        assert!(matches!(session.start("a.mp4").await, Ok(StartOutcome::Started { .. })));
        assert_eq!(session.start("b.mp4").await.unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(session.video_path(), Some("a.mp4"));

        session.cancel().await;
    }

    #[tokio::test]
    async fn test_open_error_leaves_session_idle() {
        let (mut session, _rx) = session(5, MemoryOpener::new(10), ScriptedAnalyzer::new(vec![]));
        let err = session.start("missing.mp4").await.unwrap_err();
        assert!(matches!(err, OpenError::NotFound(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.cancel().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_stuck_analysis() {
        let analyzer = Arc::new(StuckAnalyzer { entered: Notify::new() });
        let (mut session, mut rx) = session(1, MemoryOpener::new(10), analyzer.clone());
        let mut states = session.subscribe_state();

        session.start("lot.mp4").await.unwrap();
        analyzer.entered.notified().await;

        assert!(session.cancel().await);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_fault_backs_off_then_resumes() {
        let (mut session, mut rx) = session(1, Arc::new(FlakyOpener), ScriptedAnalyzer::new(vec![]));
        let started = tokio::time::Instant::now();
        session.start("lot.mp4").await.unwrap();

        let update = next_update(&mut rx).await;
        assert_eq!(update["frame_count"], 0);
        assert!(started.elapsed() >= Duration::from_secs(5));

        session.cancel().await;
        assert_eq!(session.metrics().loop_faults, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_subscriber_does_not_stop_loop() {
        let analyzer = ScriptedAnalyzer::new(vec![]);
        let (mut session, rx) = session(1, MemoryOpener::new(4), analyzer.clone());
        drop(rx);
        session.start("lot.mp4").await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.state(), SessionState::Running);
        assert!(analyzer.calls.load(Ordering::SeqCst) > 3);

        session.cancel().await;
        assert!(session.metrics().send_failures > 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_cancel() {
        let opener = MemoryOpener::new(10);
        let (mut session, mut rx) = session(5, opener.clone(), ScriptedAnalyzer::new(vec![]));

        session.start("lot.mp4").await.unwrap();
        next_update(&mut rx).await;
        session.cancel().await;

        assert!(matches!(session.start("lot.mp4").await, Ok(StartOutcome::Started { .. })));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        session.cancel().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_count_a_rewind() {
        let (mut session, mut rx) = session(5, MemoryOpener::new(100), ScriptedAnalyzer::new(vec![]));

        session.start("lot.mp4").await.unwrap();
        next_update(&mut rx).await;
        next_update(&mut rx).await;
        session.cancel().await;
        assert!(session.metrics().frames_decoded >= 6);

        session.start("lot.mp4").await.unwrap();
        next_update(&mut rx).await;
        session.cancel().await;

        let metrics = session.metrics();
        assert_eq!(metrics.rewinds, 0);
        assert!(metrics.frames_decoded < 6);
        assert_eq!(metrics.updates_sent, 1);
    }
}
