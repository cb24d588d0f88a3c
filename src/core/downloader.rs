//! Download state machine
//!
//! A [`Downloader`] owns one task's [`DownloadState`] and walks it through
//! `CREATED -> STARTED -> PAUSED / COMPLETED / ERROR`. `start()` hands the
//! transfer to a [`SegmentScheduler`] running on a background task; that task
//! also relays segment events and throttled progress to the listener.
//! `pause()` cancels the run, waits a bounded time for it to drain, then
//! records PAUSED and hands the caller a resume blob.

use parking_lot::RwLock;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::bandwidth::BandwidthController;
use crate::core::config::EngineConfig;
use crate::core::error_handling::EngineError;
use crate::core::listener::DownloadListener;
use crate::core::models::{DownloadState, DownloaderKind, ErrorInfo, Phase, SnifferInfo, Task};
use crate::core::persistence::PersistenceCodec;
use crate::core::progress_tracker::{ProgressAggregator, SpeedReading};
use crate::core::scheduler::{
    RunContext, RunOutcome, SchedulerEvent, SegmentScheduler, SharedState,
};
use crate::core::sniffer::Sniffer;

/// What a downloader is built from
#[derive(Debug, Clone)]
pub enum DownloaderSeed {
    /// A new task that still has to be sniffed
    Fresh(Task),
    /// State decoded from a resume blob
    Resumed(DownloadState),
}

/// State and counters that exist once the task has been created
#[derive(Debug, Clone)]
struct Session {
    state: SharedState,
    progress: Arc<ProgressAggregator>,
}

#[derive(Default)]
struct Control {
    run: Option<JoinHandle<()>>,
    stop: Option<CancellationToken>,
}

struct Inner {
    id: Uuid,
    kind: DownloaderKind,
    config: Arc<EngineConfig>,
    client: Client,
    sniffer: Sniffer,
    scheduler: Arc<dyn SegmentScheduler>,
    bandwidth: BandwidthController,
    seed_task: Task,
    session: RwLock<Option<Session>>,
    listener: RwLock<Option<Arc<dyn DownloadListener>>>,
    /// Serializes lifecycle transitions
    control: Mutex<Control>,
}

/// Handle to one download; cheap to clone
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Downloader {
    pub fn new(
        seed: DownloaderSeed,
        scheduler: Arc<dyn SegmentScheduler>,
        config: Arc<EngineConfig>,
        client: Client,
    ) -> Self {
        let (seed_task, session) = match seed {
            DownloaderSeed::Fresh(task) => (task, None),
            DownloaderSeed::Resumed(mut state) => {
                state.normalize_for_resume();
                let session = Session::new(state, &config);
                let task = session.state.lock().task.clone();
                (task, Some(session))
            }
        };

        let inner = Inner {
            id: Uuid::new_v4(),
            kind: scheduler.kind(),
            sniffer: Sniffer::new(client.clone(), &config),
            bandwidth: BandwidthController::new(config.bandwidth_limit),
            config,
            client,
            scheduler,
            seed_task,
            session: RwLock::new(session),
            listener: RwLock::new(None),
            control: Mutex::new(Control::default()),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> DownloaderKind {
        self.inner.kind
    }

    pub fn set_listener(&self, listener: Arc<dyn DownloadListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.inner.listener.write() = None;
    }

    /// Current phase; CREATED until `create()` succeeds
    pub fn phase(&self) -> Phase {
        self.inner
            .session()
            .map(|s| s.state.lock().phase)
            .unwrap_or(Phase::Created)
    }

    pub fn task(&self) -> Task {
        self.inner.task()
    }

    pub fn sniffer_info(&self) -> Option<SnifferInfo> {
        self.inner
            .session()
            .map(|s| s.state.lock().sniffer_info.clone())
    }

    /// Copy of the full state, `None` before `create()`
    pub fn state(&self) -> Option<DownloadState> {
        self.inner.session().map(|s| s.state.lock().clone())
    }

    /// Monotonic downloaded byte count as last reported
    pub fn downloaded(&self) -> u64 {
        self.inner
            .session()
            .map(|s| s.progress.downloaded())
            .unwrap_or(0)
    }

    pub fn speed(&self) -> SpeedReading {
        self.inner
            .session()
            .map(|s| s.progress.last_reading())
            .unwrap_or_default()
    }

    /// Sniff the source and build the initial segment layout
    pub async fn create(&self) -> Result<(), EngineError> {
        let _control = self.inner.control.lock().await;

        if let Some(session) = self.inner.session() {
            let phase = session.state.lock().phase;
            return Err(self.inner.reject("create", phase));
        }

        let task = self.inner.seed_task.clone();
        info!("Creating {} download for {}", self.inner.kind, task.source_url());

        match self.inner.build_state(task.clone()).await {
            Ok(state) => {
                let info = state.sniffer_info.clone();
                let session = Session::new(state, &self.inner.config);
                *self.inner.session.write() = Some(session);
                if let Some(listener) = self.inner.listener() {
                    listener.on_created(&task, &info);
                }
                Ok(())
            }
            Err(e) => {
                error!("Failed to create download for {}: {}", task.source_url(), e);
                if let Some(listener) = self.inner.listener() {
                    listener.on_error(&task, e.code(), &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Launch (or resume) the transfer in the background
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut control = self.inner.control.lock().await;

        let Some(session) = self.inner.session() else {
            return Err(self.inner.reject("start", Phase::Created));
        };

        let begun = {
            let mut state = session.state.lock();
            if state.phase.can_transition_to(Phase::Started) {
                state.normalize_for_resume();
                state.run_id += 1;
                state.set_phase(Phase::Started);
                Ok((state.task.clone(), state.run_id))
            } else {
                Err(state.phase)
            }
        };
        let (task, run_id) = match begun {
            Ok(begun) => begun,
            Err(phase) => return Err(self.inner.reject("start", phase)),
        };

        session.progress.restart_run();
        info!("Starting {} (run {})", task.display_name(), run_id);
        if let Some(listener) = self.inner.listener() {
            listener.on_start(&task);
        }

        let stop = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = RunContext {
            client: self.inner.client.clone(),
            config: self.inner.config.clone(),
            state: session.state.clone(),
            progress: session.progress.clone(),
            stop: stop.clone(),
            events: events_tx,
            run_id,
            bandwidth: self.inner.bandwidth.clone(),
        };

        let inner = self.inner.clone();
        control.run = Some(tokio::spawn(async move {
            inner.drive(session, ctx, events_rx).await;
        }));
        control.stop = Some(stop);
        Ok(())
    }

    /// Stop the transfer, record PAUSED and emit a resume blob
    pub async fn pause(&self) -> Result<(), EngineError> {
        let mut control = self.inner.control.lock().await;

        let Some(session) = self.inner.session() else {
            return Err(self.inner.reject("pause", Phase::Created));
        };
        let phase = session.state.lock().phase;
        if !phase.can_transition_to(Phase::Paused) {
            return Err(self.inner.reject("pause", phase));
        }

        if let Some(stop) = control.stop.take() {
            stop.cancel();
        }
        if let Some(mut handle) = control.run.take() {
            let pause_timeout = self.inner.config.pause_timeout();
            if timeout(pause_timeout, &mut handle).await.is_err() {
                warn!("Run did not stop within {:?}, abandoning it", pause_timeout);
                handle.abort();
            }
        }

        let paused = {
            let mut state = session.state.lock();
            if state.phase == Phase::Started {
                // Fence out anything the abandoned run still has in flight
                state.run_id += 1;
                state.normalize_for_resume();
                state.set_phase(Phase::Paused);
                Some(state.task.clone())
            } else {
                None
            }
        };
        drop(control);

        let Some(task) = paused else {
            debug!("Run finished before pause took effect");
            return Ok(());
        };

        info!(
            "Paused {} at {} bytes",
            task.display_name(),
            task.resume_cursor()
        );
        if let Some(listener) = self.inner.listener() {
            listener.on_pause(&task);
        }

        if let Err(e) = self.snapshot() {
            error!("Failed to snapshot {}: {}", task.display_name(), e);
        }
        Ok(())
    }

    /// Encode the current state and hand it to the listener
    pub fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        let Some(session) = self.inner.session() else {
            return Err(EngineError::InvalidTransition {
                operation: "snapshot",
                phase: Phase::Created,
            });
        };

        let state = {
            let mut state = session.state.lock();
            let cursor = state.total_bytes_written();
            state.task.set_resume_cursor(cursor);
            state.clone()
        };

        let blob = PersistenceCodec::encode(&state)?;
        debug!(
            "Snapshot of {}: {} bytes, phase {}",
            state.task.display_name(),
            blob.len(),
            state.phase
        );
        if let Some(listener) = self.inner.listener() {
            listener.on_save_instance(&state.task, &blob);
        }
        Ok(blob)
    }

    /// Wait for the background run, if any, to finish
    pub async fn wait(&self) {
        let handle = self.inner.control.lock().await.run.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Session {
    fn new(state: DownloadState, config: &EngineConfig) -> Self {
        let progress =
            ProgressAggregator::new(&state.segments, config.speed_window, config.speed_smoothing);
        Self {
            state: Arc::new(parking_lot::Mutex::new(state)),
            progress: Arc::new(progress),
        }
    }
}

impl Inner {
    fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    fn listener(&self) -> Option<Arc<dyn DownloadListener>> {
        self.listener.read().clone()
    }

    fn task(&self) -> Task {
        self.session()
            .map(|s| s.state.lock().task.clone())
            .unwrap_or_else(|| self.seed_task.clone())
    }

    async fn build_state(&self, task: Task) -> Result<DownloadState, EngineError> {
        let info = self.sniffer.sniff(task.source_url()).await?;
        let segments = self.scheduler.plan_segments(&info, &self.config)?;
        Ok(DownloadState::new(self.kind, task, info, segments))
    }

    /// Report an illegal transition without touching the state
    fn reject(&self, operation: &'static str, phase: Phase) -> EngineError {
        let error = EngineError::InvalidTransition { operation, phase };
        warn!("{}", error);
        if let Some(listener) = self.listener() {
            listener.on_warning(&self.task(), error.code(), &error.to_string());
        }
        error
    }

    /// Background half of a run: drive the scheduler and relay its events
    async fn drive(
        self: Arc<Self>,
        session: Session,
        ctx: RunContext,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
    ) {
        let run_id = ctx.run_id;
        let stop = ctx.stop.clone();
        let scheduler = self.scheduler.clone();
        let run = scheduler.run(ctx);
        tokio::pin!(run);

        let mut ticker = interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut last_reported = None;

        let result = loop {
            tokio::select! {
                biased;
                result = &mut run => break result,
                Some(event) = events.recv() => self.relay(&session, event),
                _ = ticker.tick() => self.report_progress(&session, &mut last_reported, false),
            }
        };

        while let Ok(event) = events.try_recv() {
            self.relay(&session, event);
        }

        self.finish_run(&session, run_id, &stop, result, &mut last_reported);
    }

    fn relay(&self, session: &Session, event: SchedulerEvent) {
        let Some(listener) = self.listener() else {
            return;
        };
        let task = session.state.lock().task.clone();
        match event {
            SchedulerEvent::SegmentDone { index, count } => {
                listener.on_segment_complete(&task, index, count)
            }
            SchedulerEvent::Warning { code, message } => listener.on_warning(&task, code, &message),
        }
    }

    fn report_progress(&self, session: &Session, last_reported: &mut Option<u64>, force: bool) {
        let speed = session.progress.sample();
        let downloaded = session.progress.downloaded();
        if !force && *last_reported == Some(downloaded) {
            return;
        }
        *last_reported = Some(downloaded);

        let (task, total) = {
            let state = session.state.lock();
            (state.task.clone(), state.reported_total())
        };
        debug!(
            "{}: {}/{} bytes, {:.0} B/s (smoothed {:.0} B/s)",
            task.display_name(),
            downloaded,
            total,
            speed.instant,
            speed.smoothed
        );
        if let Some(listener) = self.listener() {
            listener.on_progress(&task, total, downloaded);
        }
    }

    fn finish_run(
        &self,
        session: &Session,
        run_id: u64,
        stop: &CancellationToken,
        result: Result<RunOutcome, EngineError>,
        last_reported: &mut Option<u64>,
    ) {
        let result = match result {
            Ok(RunOutcome::Completed) if !session.state.lock().is_complete() => Err(
                EngineError::transfer("scheduler finished with unfinished segments"),
            ),
            other => other,
        };

        match result {
            Ok(RunOutcome::Stopped) => debug!("Run {} stopped", run_id),
            Ok(RunOutcome::Completed) => {
                let completed = {
                    let mut state = session.state.lock();
                    if state.run_id != run_id || state.phase != Phase::Started {
                        None
                    } else {
                        let total = state.total_bytes_written();
                        state.task.set_resume_cursor(total);
                        state.set_phase(Phase::Completed);
                        Some((state.task.clone(), total))
                    }
                };
                let Some((task, total)) = completed else {
                    return;
                };

                self.report_progress(session, last_reported, true);
                info!("Completed {} ({} bytes)", task.display_name(), total);
                if let Some(listener) = self.listener() {
                    listener.on_complete(&task, total);
                }
            }
            Err(error) if stop.is_cancelled() => {
                debug!("Run {} ended while stopping: {}", run_id, error);
            }
            Err(error) => {
                let failed = {
                    let mut state = session.state.lock();
                    if state.run_id != run_id || state.phase != Phase::Started {
                        None
                    } else {
                        state.last_error = Some(ErrorInfo::from(&error));
                        state.set_phase(Phase::Error);
                        Some(state.task.clone())
                    }
                };
                let Some(task) = failed else {
                    return;
                };

                error!("Download {} failed: {}", task.display_name(), error);
                if let Some(listener) = self.listener() {
                    listener.on_error(&task, error.code(), &error.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::listener::{ChannelListener, DownloadEvent};
    use crate::core::models::{Segment, SegmentState};
    use crate::core::range_scheduler::RangeScheduler;
    use crate::utils::network::build_client;

    fn paused_state() -> DownloadState {
        let task = Task::new("http://127.0.0.1:1/file.bin", "file", "/tmp/none");
        let info = SnifferInfo {
            real_url: "http://127.0.0.1:1/file.bin".to_string(),
            content_length: 100,
            is_segmented: false,
            segment_manifest: None,
            accepts_ranges: true,
            content_type: None,
            is_live: false,
        };
        let mut segments = vec![Segment::new(0, 0, Some(49)), Segment::new(1, 50, Some(99))];
        segments[0].bytes_written = 20;
        segments[0].state = SegmentState::InProgress;
        let mut state = DownloadState::new(DownloaderKind::MultiThread, task, info, segments);
        state.phase = Phase::Started;
        state
    }

    fn resumed() -> Downloader {
        let config = Arc::new(EngineConfig::default());
        let client = build_client(&config).unwrap();
        Downloader::new(
            DownloaderSeed::Resumed(paused_state()),
            Arc::new(RangeScheduler::new()),
            config,
            client,
        )
    }

    #[tokio::test]
    async fn test_resumed_seed_is_normalized() {
        let downloader = resumed();
        let state = downloader.state().unwrap();

        assert_eq!(downloader.phase(), Phase::Paused);
        assert_eq!(state.segments[0].state, SegmentState::Pending);
        assert_eq!(downloader.task().resume_cursor(), 20);
        assert_eq!(downloader.downloaded(), 20);
    }

    #[tokio::test]
    async fn test_illegal_transitions_report_warning() {
        let downloader = resumed();
        let (listener, mut events) = ChannelListener::new();
        downloader.set_listener(Arc::new(listener));

        let err = downloader.pause().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                operation: "pause",
                phase: Phase::Paused
            }
        ));
        let err = downloader.create().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        assert_eq!(downloader.phase(), Phase::Paused);
        for _ in 0..2 {
            match events.try_recv().unwrap() {
                DownloadEvent::Warning { code, .. } => {
                    assert_eq!(code, crate::core::error_handling::ErrorCode::InvalidTransition)
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_snapshot_emits_blob() {
        let downloader = resumed();
        let (listener, mut events) = ChannelListener::new();
        downloader.set_listener(Arc::new(listener));

        let blob = downloader.snapshot().unwrap();
        let decoded = PersistenceCodec::decode(&blob).unwrap();
        assert_eq!(decoded.phase, Phase::Paused);
        assert_eq!(decoded.total_bytes_written(), 20);

        match events.try_recv().unwrap() {
            DownloadEvent::SaveInstance { blob: sent, .. } => assert_eq!(sent, blob),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fresh_downloader_before_create() {
        let config = Arc::new(EngineConfig::default());
        let client = build_client(&config).unwrap();
        let task = Task::new("http://127.0.0.1:1/file.bin", "file", "/tmp/none");
        let downloader = Downloader::new(
            DownloaderSeed::Fresh(task.clone()),
            Arc::new(RangeScheduler::new()),
            config,
            client,
        );

        assert_eq!(downloader.phase(), Phase::Created);
        assert!(downloader.state().is_none());
        assert_eq!(downloader.task(), task);
        assert!(downloader.snapshot().is_err());
        assert!(downloader.start().await.is_err());
    }
}
