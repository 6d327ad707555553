//! The recognition worker thread and the supervisor that owns it.
//!
//! The worker opens the camera itself, so the device is held only while the
//! loop runs and is released on every exit path. The supervisor is the single
//! owner of the pipeline: it hands it to the worker on start and takes it
//! back on stop, which is how enrollment gets exclusive camera access.

use crate::pipeline::StepOutcome;
use baseera_hw::{Camera, CameraError, CaptureSession, FrameSource};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("worker did not stop within {0:?}")]
    StopTimeout(Duration),
    #[error("worker thread panicked")]
    WorkerPanicked,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
    #[error("recognition pipeline is no longer available")]
    PipelineLost,
}

/// One iteration of work per call, driven by the worker thread.
pub trait FrameLoop: Send + 'static {
    fn step(&mut self, source: &mut dyn FrameSource) -> StepOutcome;
    fn reset_session(&mut self);
}

/// Opens the camera for whoever currently owns it.
pub trait CameraOpener: Send + Sync + 'static {
    type Source: FrameSource;
    fn open(&self) -> Result<Self::Source, CameraError>;
}

pub struct V4lCamera {
    device: String,
    width: u32,
    height: u32,
}

impl V4lCamera {
    pub fn new(device: String, width: u32, height: u32) -> Self {
        Self { device, width, height }
    }
}

impl CameraOpener for V4lCamera {
    type Source = CaptureSession;

    fn open(&self) -> Result<CaptureSession, CameraError> {
        let camera = Camera::open(&self.device, self.width, self.height)?;
        tracing::info!(
            device = %self.device,
            width = camera.width,
            height = camera.height,
            fourcc = %camera.fourcc,
            "camera opened"
        );
        camera.into_session()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    /// Stop was requested but the worker has not exited yet.
    Stopping,
    Lost,
}

struct Worker<P> {
    stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    thread: JoinHandle<P>,
}

enum Slot<P> {
    Idle(P),
    Running(Worker<P>),
    Stopping(Worker<P>),
    Lost,
}

/// Signals the supervisor when the worker thread ends, including by panic.
struct DoneSignal(mpsc::Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

pub struct Supervisor<P, C> {
    slot: Slot<P>,
    opener: Arc<C>,
    stop_timeout: Duration,
    read_backoff: Duration,
}

impl<P: FrameLoop, C: CameraOpener> Supervisor<P, C> {
    pub fn new(pipeline: P, opener: C, stop_timeout: Duration, read_backoff: Duration) -> Self {
        Self {
            slot: Slot::Idle(pipeline),
            opener: Arc::new(opener),
            stop_timeout,
            read_backoff,
        }
    }

    pub fn state(&self) -> WorkerState {
        match self.slot {
            Slot::Idle(_) => WorkerState::Idle,
            Slot::Running(_) => WorkerState::Running,
            Slot::Stopping(_) => WorkerState::Stopping,
            Slot::Lost => WorkerState::Lost,
        }
    }

    #[cfg(test)]
    pub(crate) fn opener(&self) -> &C {
        &self.opener
    }

    /// Open the camera on a new worker thread and start the frame loop.
    ///
    /// A camera that cannot be opened is fatal for this start; no retry is
    /// attempted and the pipeline stays with the supervisor.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let pipeline = match std::mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Idle(pipeline) => pipeline,
            Slot::Running(worker) => {
                self.slot = Slot::Running(worker);
                return Ok(());
            }
            Slot::Stopping(worker) => {
                self.slot = Slot::Stopping(worker);
                self.await_worker(Duration::ZERO)?;
                match std::mem::replace(&mut self.slot, Slot::Lost) {
                    Slot::Idle(pipeline) => pipeline,
                    _ => return Err(EngineError::PipelineLost),
                }
            }
            Slot::Lost => return Err(EngineError::PipelineLost),
        };

        match spawn_worker(pipeline, Arc::clone(&self.opener), self.read_backoff) {
            Ok(worker) => {
                self.slot = Slot::Running(worker);
                Ok(())
            }
            Err((e, pipeline)) => {
                self.slot = pipeline.map_or(Slot::Lost, Slot::Idle);
                Err(e)
            }
        }
    }

    /// Ask the worker to stop and wait up to the stop timeout for it.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if let Slot::Running(worker) | Slot::Stopping(worker) = &self.slot {
            worker.stop.store(true, Ordering::Release);
        }
        self.await_worker(self.stop_timeout)
    }

    fn await_worker(&mut self, timeout: Duration) -> Result<(), EngineError> {
        let worker = match std::mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Running(worker) | Slot::Stopping(worker) => worker,
            other => {
                self.slot = other;
                return Ok(());
            }
        };

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => match worker.thread.join() {
                Ok(pipeline) => {
                    self.slot = Slot::Idle(pipeline);
                    Ok(())
                }
                Err(_) => {
                    tracing::error!("recognition worker panicked");
                    Err(EngineError::WorkerPanicked)
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "recognition worker still busy");
                self.slot = Slot::Stopping(worker);
                Err(EngineError::StopTimeout(timeout))
            }
        }
    }

    /// Block until a worker that was asked to stop has exited.
    fn join_worker(&mut self) -> Result<(), EngineError> {
        let worker = match std::mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Running(worker) | Slot::Stopping(worker) => worker,
            other => {
                self.slot = other;
                return Ok(());
            }
        };
        worker.stop.store(true, Ordering::Release);
        match worker.thread.join() {
            Ok(pipeline) => {
                self.slot = Slot::Idle(pipeline);
                Ok(())
            }
            Err(_) => {
                tracing::error!("recognition worker panicked");
                Err(EngineError::WorkerPanicked)
            }
        }
    }

    /// Stop the worker, give `f` the pipeline and a freshly opened camera,
    /// then restart the worker whatever `f` returned.
    ///
    /// A worker busy past the stop timeout is waited for, so the camera is
    /// never shared and the restart always happens.
    pub fn with_exclusive_camera<R>(
        &mut self,
        f: impl FnOnce(&mut P, &mut C::Source) -> R,
    ) -> Result<R, EngineError> {
        match self.stop() {
            Ok(()) => {}
            Err(EngineError::StopTimeout(waited)) => {
                tracing::warn!(?waited, "waiting for recognition worker to finish its frame");
                self.join_worker()?;
            }
            Err(e) => return Err(e),
        }
        let result = match &mut self.slot {
            Slot::Idle(pipeline) => match self.opener.open() {
                Ok(mut source) => Ok(f(pipeline, &mut source)),
                Err(e) => Err(EngineError::Camera(e)),
            },
            _ => Err(EngineError::PipelineLost),
        };
        if let Err(e) = self.start() {
            tracing::error!(error = %e, "failed to restart recognition worker");
        }
        result
    }
}

fn spawn_worker<P: FrameLoop, C: CameraOpener>(
    mut pipeline: P,
    opener: Arc<C>,
    read_backoff: Duration,
) -> Result<Worker<P>, (EngineError, Option<P>)> {
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CameraError>>();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let flag = Arc::clone(&stop);

    let spawned = thread::Builder::new()
        .name("baseera-worker".into())
        .spawn(move || {
            let _done = DoneSignal(done_tx);
            let mut source = match opener.open() {
                Ok(source) => source,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return pipeline;
                }
            };
            let _ = ready_tx.send(Ok(()));
            run_frame_loop(&mut pipeline, &mut source, &flag, read_backoff);
            pipeline
        });
    let thread = spawned.map_err(|e| (EngineError::Spawn(e), None))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Worker {
            stop,
            done: done_rx,
            thread,
        }),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "camera unavailable; recognition worker not started");
            match thread.join() {
                Ok(pipeline) => Err((EngineError::Camera(e), Some(pipeline))),
                Err(_) => Err((EngineError::WorkerPanicked, None)),
            }
        }
        Err(_) => {
            let _ = thread.join();
            Err((EngineError::WorkerPanicked, None))
        }
    }
}

fn run_frame_loop<P: FrameLoop>(pipeline: &mut P, source: &mut dyn FrameSource, stop: &AtomicBool, backoff: Duration) {
    tracing::info!("recognition worker started");
    pipeline.reset_session();
    while !stop.load(Ordering::Acquire) {
        match panic::catch_unwind(AssertUnwindSafe(|| pipeline.step(source))) {
            Ok(StepOutcome::NoFrame) => thread::sleep(backoff),
            Ok(_) => {}
            Err(_) => {
                tracing::error!("frame iteration panicked; liveness session reset");
                pipeline.reset_session();
            }
        }
    }
    tracing::info!("recognition worker stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use baseera_hw::Frame;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Clone, Default)]
    pub(crate) struct CameraStats {
        pub(crate) opens: Arc<AtomicUsize>,
        pub(crate) active: Arc<AtomicUsize>,
        pub(crate) max_active: Arc<AtomicUsize>,
    }

    pub(crate) struct CountingSource {
        stats: CameraStats,
        reads: u32,
    }

    impl FrameSource for CountingSource {
        fn read(&mut self) -> Result<Frame, CameraError> {
            self.reads += 1;
            Ok(Frame::from_gray(vec![128; 64 * 64], 64, 64, self.reads).unwrap())
        }
    }

    impl Drop for CountingSource {
        fn drop(&mut self) {
            self.stats.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct MockCamera {
        pub(crate) stats: CameraStats,
        pub(crate) unplugged: AtomicBool,
    }

    impl CameraOpener for MockCamera {
        type Source = CountingSource;

        fn open(&self) -> Result<CountingSource, CameraError> {
            if self.unplugged.load(Ordering::SeqCst) {
                return Err(CameraError::DeviceNotFound("/dev/video9".into()));
            }
            self.stats.opens.fetch_add(1, Ordering::SeqCst);
            let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_active.fetch_max(active, Ordering::SeqCst);
            Ok(CountingSource {
                stats: self.stats.clone(),
                reads: 0,
            })
        }
    }

    #[derive(Default)]
    struct CountingLoop {
        steps: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        panic_on_step: Option<usize>,
        step_delay: Duration,
    }

    impl FrameLoop for CountingLoop {
        fn step(&mut self, source: &mut dyn FrameSource) -> StepOutcome {
            let n = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.panic_on_step {
                panic!("injected failure");
            }
            thread::sleep(self.step_delay.max(Duration::from_millis(1)));
            match source.read() {
                Ok(_) => StepOutcome::Analyzed,
                Err(_) => StepOutcome::NoFrame,
            }
        }

        fn reset_session(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn supervisor(frame_loop: CountingLoop) -> (Supervisor<CountingLoop, MockCamera>, CameraStats) {
        let camera = MockCamera::default();
        let stats = camera.stats.clone();
        (
            Supervisor::new(frame_loop, camera, Duration::from_secs(1), Duration::from_millis(5)),
            stats,
        )
    }

    #[test]
    fn test_start_and_stop_release_camera() {
        let frame_loop = CountingLoop::default();
        let steps = Arc::clone(&frame_loop.steps);
        let (mut sup, stats) = supervisor(frame_loop);

        sup.start().unwrap();
        assert_eq!(sup.state(), WorkerState::Running);
        assert!(wait_until(|| steps.load(Ordering::SeqCst) > 3));

        sup.stop().unwrap();
        assert_eq!(sup.state(), WorkerState::Idle);
        assert_eq!(stats.active.load(Ordering::SeqCst), 0);

        let after_stop = steps.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(steps.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_camera_open_failure_is_fatal_and_keeps_pipeline() {
        let (mut sup, stats) = supervisor(CountingLoop::default());
        sup.opener.unplugged.store(true, Ordering::SeqCst);

        assert!(matches!(sup.start(), Err(EngineError::Camera(_))));
        assert_eq!(sup.state(), WorkerState::Idle);
        assert_eq!(stats.active.load(Ordering::SeqCst), 0);

        sup.opener.unplugged.store(false, Ordering::SeqCst);
        sup.start().unwrap();
        sup.stop().unwrap();
    }

    #[test]
    fn test_exclusive_camera_never_shared() {
        let frame_loop = CountingLoop::default();
        let resets = Arc::clone(&frame_loop.resets);
        let (mut sup, stats) = supervisor(frame_loop);
        sup.start().unwrap();

        let read = sup
            .with_exclusive_camera(|_pipeline, source| {
                assert_eq!(stats.active.load(Ordering::SeqCst), 1);
                source.read().is_ok()
            })
            .unwrap();
        assert!(read);

        assert_eq!(sup.state(), WorkerState::Running);
        assert_eq!(stats.opens.load(Ordering::SeqCst), 3);
        assert_eq!(stats.max_active.load(Ordering::SeqCst), 1);
        assert!(wait_until(|| resets.load(Ordering::SeqCst) == 2));
        sup.stop().unwrap();
    }

    #[test]
    fn test_exclusive_camera_restarts_after_open_failure() {
        let (mut sup, _stats) = supervisor(CountingLoop::default());
        sup.start().unwrap();
        sup.opener.unplugged.store(true, Ordering::SeqCst);
        let result = sup.with_exclusive_camera(|_, _| ());
        assert!(matches!(result, Err(EngineError::Camera(_))));
        // Restart also failed while unplugged; the pipeline is kept.
        assert_eq!(sup.state(), WorkerState::Idle);
    }

    #[test]
    fn test_panicking_iteration_does_not_kill_worker() {
        let frame_loop = CountingLoop {
            panic_on_step: Some(3),
            ..CountingLoop::default()
        };
        let steps = Arc::clone(&frame_loop.steps);
        let resets = Arc::clone(&frame_loop.resets);
        let (mut sup, _stats) = supervisor(frame_loop);

        sup.start().unwrap();
        assert!(wait_until(|| steps.load(Ordering::SeqCst) > 6));
        assert_eq!(resets.load(Ordering::SeqCst), 2);
        sup.stop().unwrap();
        assert_eq!(sup.state(), WorkerState::Idle);
    }

    #[test]
    fn test_stop_timeout_is_bounded() {
        let frame_loop = CountingLoop {
            step_delay: Duration::from_millis(200),
            ..CountingLoop::default()
        };
        let steps = Arc::clone(&frame_loop.steps);
        let camera = MockCamera::default();
        let mut sup = Supervisor::new(frame_loop, camera, Duration::from_millis(10), Duration::from_millis(5));

        sup.start().unwrap();
        assert!(wait_until(|| steps.load(Ordering::SeqCst) >= 1));
        let started = Instant::now();
        assert!(matches!(sup.stop(), Err(EngineError::StopTimeout(_))));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(sup.state(), WorkerState::Stopping);

        // The worker observes the flag after its current iteration.
        assert!(wait_until(|| sup.stop().is_ok()));
        assert_eq!(sup.state(), WorkerState::Idle);
    }

    #[test]
    fn test_exclusive_camera_waits_for_slow_worker_and_restarts() {
        let frame_loop = CountingLoop {
            step_delay: Duration::from_millis(200),
            ..CountingLoop::default()
        };
        let steps = Arc::clone(&frame_loop.steps);
        let camera = MockCamera::default();
        let stats = camera.stats.clone();
        let mut sup = Supervisor::new(frame_loop, camera, Duration::from_millis(10), Duration::from_millis(5));

        sup.start().unwrap();
        assert!(wait_until(|| steps.load(Ordering::SeqCst) >= 1));

        let read = sup.with_exclusive_camera(|_, source| source.read().is_ok()).unwrap();
        assert!(read);
        assert_eq!(sup.state(), WorkerState::Running);
        assert_eq!(stats.max_active.load(Ordering::SeqCst), 1);

        let before = steps.load(Ordering::SeqCst);
        assert!(wait_until(|| steps.load(Ordering::SeqCst) > before));
        assert!(wait_until(|| sup.stop().is_ok()));
    }
}
