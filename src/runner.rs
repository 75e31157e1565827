//! Background worker that runs one enlarge request at a time.
//!
//! Requests coalesce: submitting a new one makes the worker abandon whatever
//! it is computing at the next checkpoint and start on the newest request.
//! Results and progress come back as [`RunnerEvent`]s on a channel owned by
//! the caller.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::color::Bitmap;
use crate::format::{Format, Placement};
use crate::noise::FractalNoiseTable;
use crate::params::EnlargeParams;
use crate::EnlargeError;

/// Relative CPU share granted to a job by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Activity {
    #[default]
    None,
    Low,
    Middle,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    CancelRequested,
    Failed,
}

/// What happens to a finished destination buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    InMemory,
    Save { path: PathBuf, quality: u8 },
}

#[derive(Debug, Clone)]
pub struct EnlargeRequest {
    pub source: Arc<Bitmap>,
    pub format: Format,
    pub params: EnlargeParams,
    pub delivery: Delivery,
}

#[derive(Debug)]
pub struct RunnerEvent {
    pub runner: u64,
    pub request: u64,
    pub kind: RunnerEventKind,
}

#[derive(Debug)]
pub enum RunnerEventKind {
    /// Integer percentage, non-decreasing within one request.
    Progress(u8),
    Delivered(Bitmap),
    Saved { width: usize, height: usize },
    SaveFailed(String),
    AllocFailed,
}

impl RunnerEventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunnerEventKind::Progress(_))
    }
}

#[derive(Debug)]
struct Control {
    state: RunnerState,
    activity: Activity,
    abort: bool,
}

#[derive(Debug)]
struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    latest: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            control: Mutex::new(Control {
                state: RunnerState::Idle,
                activity: Activity::High,
                abort: false,
            }),
            wake: Condvar::new(),
            latest: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RunnerState) {
        self.lock().state = state;
    }

    fn is_stale(&self, id: u64, control: &Control) -> bool {
        control.abort || self.latest.load(Ordering::SeqCst) != id
    }

    /// Cancellation checkpoint for request `id`, throttled by the activity level.
    fn checkpoint(&self, id: u64) -> bool {
        let mut control = self.lock();
        loop {
            if self.is_stale(id, &control) {
                return true;
            }
            match control.activity {
                Activity::None => {
                    control = self
                        .wake
                        .wait(control)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Activity::Low => {
                    drop(control);
                    thread::yield_now();
                    return false;
                }
                Activity::Middle | Activity::High => return false,
            }
        }
    }
}

struct Submission {
    id: u64,
    request: EnlargeRequest,
}

/// Owner handle of one worker thread.
///
/// Dropping the runner aborts in-flight work and joins the thread.
#[derive(Debug)]
pub struct EnlargeRunner {
    id: u64,
    shared: Arc<Shared>,
    requests: Option<mpsc::Sender<Submission>>,
    worker: Option<JoinHandle<()>>,
    next_request: u64,
}

impl EnlargeRunner {
    /// Spawns the worker; events are tagged with `id` and sent to `events`.
    pub fn new(id: u64, events: mpsc::Sender<RunnerEvent>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::new());
        let (requests, request_rx) = mpsc::channel::<Submission>();
        let mut worker = Worker {
            runner: id,
            shared: shared.clone(),
            events,
            noise: None,
        };
        let handle = thread::Builder::new()
            .name(format!("enlarge-runner-{id}"))
            .spawn(move || worker.run(request_rx))?;

        Ok(Self {
            id,
            shared,
            requests: Some(requests),
            worker: Some(handle),
            next_request: 1,
        })
    }

    /// Convenience constructor returning the event receiver as well.
    pub fn with_channel(id: u64) -> std::io::Result<(Self, mpsc::Receiver<RunnerEvent>)> {
        let (tx, rx) = mpsc::channel();
        Ok((Self::new(id, tx)?, rx))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues `request`, superseding anything in flight. Returns its id.
    pub fn request(&mut self, request: EnlargeRequest) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        {
            let _control = self.shared.lock();
            self.shared.latest.store(id, Ordering::SeqCst);
        }
        self.shared.wake.notify_all();
        if let Some(requests) = &self.requests {
            // The worker only exits after `requests` is dropped.
            let _ = requests.send(Submission { id, request });
        }
        id
    }

    /// Stops the current request without starting another one.
    pub fn cancel(&mut self) {
        let id = self.next_request;
        self.next_request += 1;
        {
            let mut control = self.shared.lock();
            if control.state == RunnerState::Running {
                control.state = RunnerState::CancelRequested;
            }
            self.shared.latest.store(id, Ordering::SeqCst);
        }
        self.shared.wake.notify_all();
        debug!(runner = self.id, "cancel requested");
    }

    pub fn set_activity(&self, activity: Activity) {
        self.shared.lock().activity = activity;
        self.shared.wake.notify_all();
    }

    pub fn activity(&self) -> Activity {
        self.shared.lock().activity
    }

    pub fn state(&self) -> RunnerState {
        self.shared.lock().state
    }
}

impl Drop for EnlargeRunner {
    fn drop(&mut self) {
        self.shared.lock().abort = true;
        self.shared.wake.notify_all();
        self.requests.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!(runner = self.id, "runner thread panicked");
            }
        }
    }
}

struct Worker {
    runner: u64,
    shared: Arc<Shared>,
    events: mpsc::Sender<RunnerEvent>,
    noise: Option<FractalNoiseTable>,
}

impl Worker {
    fn run(&mut self, requests: mpsc::Receiver<Submission>) {
        while let Ok(submission) = requests.recv() {
            if self.shared.lock().abort {
                break;
            }
            if submission.id != self.shared.latest.load(Ordering::SeqCst) {
                debug!(runner = self.runner, request = submission.id, "skipping superseded request");
                continue;
            }
            self.process(submission);
        }
    }

    fn send(&self, request: u64, kind: RunnerEventKind) {
        // A closed channel means nobody is listening any more.
        let _ = self.events.send(RunnerEvent {
            runner: self.runner,
            request,
            kind,
        });
    }

    fn refresh_noise(&mut self, scale_x: f32) {
        let stale = self
            .noise
            .as_ref()
            .map_or(true, |noise| noise.scale() != scale_x);
        if stale {
            debug!(runner = self.runner, scale_x, "building fractal noise table");
            self.noise = Some(FractalNoiseTable::new(scale_x));
        }
    }

    fn process(&mut self, submission: Submission) {
        let Submission { id, request } = submission;
        self.shared.set_state(RunnerState::Running);
        info!(
            runner = self.runner,
            request = id,
            width = request.format.clip_width(),
            height = request.format.clip_height(),
            "enlarge started"
        );
        self.send(id, RunnerEventKind::Progress(0));

        let placement = Placement::new(&request.format);
        if request.params.fractal_noise > 0 {
            self.refresh_noise(placement.scale_x);
        }
        let noise = self.noise.as_ref().filter(|_| request.params.fractal_noise > 0);

        let shared = self.shared.clone();
        let cancel = move || shared.checkpoint(id);
        let events = self.events.clone();
        let runner = self.runner;
        let mut last = 0u8;
        let mut progress = |fraction: f32| {
            let percent = (fraction.clamp(0.0, 1.0) * 100.0) as u8;
            if percent > last && percent < 100 {
                last = percent;
                let _ = events.send(RunnerEvent {
                    runner,
                    request: id,
                    kind: RunnerEventKind::Progress(percent),
                });
            }
        };

        let result = request.source.enlarge(
            &request.format,
            &request.params,
            noise,
            Some(&cancel),
            &mut progress,
        );
        let superseded = {
            let control = self.shared.lock();
            self.shared.is_stale(id, &control)
        };

        if superseded {
            debug!(runner = self.runner, request = id, "request abandoned");
            self.shared.set_state(RunnerState::Idle);
            self.send(id, RunnerEventKind::Progress(100));
            return;
        }
        let bitmap = match result {
            Err(EnlargeError::Alloc { bytes }) => {
                warn!(runner = self.runner, request = id, bytes, "allocation failed");
                self.shared.set_state(RunnerState::Failed);
                self.send(id, RunnerEventKind::Progress(100));
                self.send(id, RunnerEventKind::AllocFailed);
                return;
            }
            Err(err) => {
                warn!(runner = self.runner, request = id, error = %err, "enlarge failed");
                self.shared.set_state(RunnerState::Failed);
                self.send(id, RunnerEventKind::Progress(100));
                self.send(id, RunnerEventKind::SaveFailed(err.to_string()));
                return;
            }
            Ok(bitmap) => bitmap,
        };

        let kind = match &request.delivery {
            Delivery::InMemory => RunnerEventKind::Delivered(bitmap),
            Delivery::Save { path, quality } => match bitmap.save(path, *quality) {
                Ok(()) => {
                    info!(runner = self.runner, path = %path.display(), "saved result");
                    RunnerEventKind::Saved {
                        width: bitmap.width(),
                        height: bitmap.height(),
                    }
                }
                Err(err) => {
                    warn!(runner = self.runner, path = %path.display(), error = %err, "save failed");
                    RunnerEventKind::SaveFailed(err.to_string())
                }
            },
        };
        self.shared.set_state(match kind {
            RunnerEventKind::SaveFailed(_) => RunnerState::Failed,
            _ => RunnerState::Idle,
        });
        self.send(id, RunnerEventKind::Progress(100));
        self.send(id, kind);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pixel::Rgb;
    use crate::plane::Plane;

    const WAIT: Duration = Duration::from_secs(60);

    fn gray(width: usize, height: usize) -> Arc<Bitmap> {
        Arc::new(Bitmap::Rgb(Plane::filled(width, height, Rgb::splat(0.5))))
    }

    fn request(source: Arc<Bitmap>, scale: f32) -> EnlargeRequest {
        let (w, h) = source.dimensions();
        EnlargeRequest {
            source,
            format: Format::uniform(w, h, scale),
            params: EnlargeParams::default(),
            delivery: Delivery::InMemory,
        }
    }

    fn collect_until_terminal(rx: &mpsc::Receiver<RunnerEvent>) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        loop {
            let event = rx.recv_timeout(WAIT).expect("runner event");
            let done = event.kind.is_terminal();
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[test]
    fn delivers_in_memory_with_progress() {
        let (mut runner, rx) = EnlargeRunner::with_channel(7).unwrap();
        let id = runner.request(request(gray(30, 20), 2.0));
        let events = collect_until_terminal(&rx);

        assert!(events.iter().all(|e| e.runner == 7 && e.request == id));
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e.kind {
                RunnerEventKind::Progress(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        match &events.last().unwrap().kind {
            RunnerEventKind::Delivered(bitmap) => assert_eq!(bitmap.dimensions(), (60, 40)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[test]
    fn saves_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let (mut runner, rx) = EnlargeRunner::with_channel(1).unwrap();
        let mut req = request(gray(10, 10), 1.5);
        req.delivery = Delivery::Save {
            path: path.clone(),
            quality: 90,
        };
        runner.request(req);
        let events = collect_until_terminal(&rx);
        assert!(matches!(
            events.last().unwrap().kind,
            RunnerEventKind::Saved { width: 15, height: 15 }
        ));
        assert!(path.exists());
    }

    #[test]
    fn reports_allocation_failure() {
        let (mut runner, rx) = EnlargeRunner::with_channel(2).unwrap();
        let mut req = request(gray(10, 10), 2.0);
        req.format = req.format.with_dst_clip(0, 0, i32::MAX, i32::MAX);
        runner.request(req);
        let events = collect_until_terminal(&rx);
        assert!(matches!(events.last().unwrap().kind, RunnerEventKind::AllocFailed));
        assert_eq!(runner.state(), RunnerState::Failed);
    }

    #[test]
    fn stale_allocation_failure_stays_silent() {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::new());
        shared.latest.store(2, Ordering::SeqCst);
        let mut worker = Worker {
            runner: 5,
            shared: shared.clone(),
            events: tx,
            noise: None,
        };
        let mut req = request(gray(10, 10), 2.0);
        req.format = req.format.with_dst_clip(0, 0, i32::MAX, i32::MAX);
        worker.process(Submission { id: 1, request: req });
        drop(worker);

        let kinds: Vec<RunnerEventKind> = rx.try_iter().map(|e| e.kind).collect();
        assert!(
            matches!(
                kinds.as_slice(),
                [RunnerEventKind::Progress(0), RunnerEventKind::Progress(100)]
            ),
            "{kinds:?}"
        );
        assert_eq!(shared.lock().state, RunnerState::Idle);
    }

    #[test]
    fn cancel_ends_silently() {
        let (mut runner, rx) = EnlargeRunner::with_channel(3).unwrap();
        runner.set_activity(Activity::None);
        runner.request(request(gray(64, 64), 3.0));
        runner.cancel();
        runner.set_activity(Activity::High);
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(500)) {
            assert!(!event.kind.is_terminal(), "{event:?}");
        }
    }

    #[test]
    fn drop_joins_a_parked_worker() {
        let (mut runner, _rx) = EnlargeRunner::with_channel(4).unwrap();
        runner.set_activity(Activity::None);
        runner.request(request(gray(64, 64), 3.0));
        drop(runner);
    }
}
