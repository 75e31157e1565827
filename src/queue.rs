//! Ordered job list with priority assignment and progress aggregation.
//!
//! Everything here runs on the caller's thread. Runners report back through
//! a single event channel which [`JobQueue::process_events`] drains.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::job::{Job, JobErrorKind, JobId, JobKind, JobStatus, SingleImageJob};
use crate::runner::{Activity, RunnerEvent, RunnerEventKind};

/// Jobs that may hold a non-idle activity at the same time.
pub const ACTIVE_SLOTS: i32 = 3;
/// Upper bound on scheduling rounds after one change.
const MAX_SETTLE_PASSES: usize = 64;
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Something the front end may want to show.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueNotice {
    Status { job: JobId, message: String },
    Error { job: JobId, message: String },
    Progress(u8),
    JobCount { ended: usize, total: usize },
}

pub struct JobQueue {
    jobs: Vec<Job>,
    next_id: JobId,
    finished: usize,
    events_tx: Sender<RunnerEvent>,
    events_rx: Receiver<RunnerEvent>,
    notices: Vec<QueueNotice>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            jobs: Vec::new(),
            next_id: 1,
            finished: 0,
            events_tx,
            events_rx,
            notices: Vec::new(),
        }
    }

    pub fn add_job(&mut self, kind: impl Into<JobKind>) -> JobId {
        let id = self.push(kind.into(), None);
        self.settle();
        id
    }

    fn push(&mut self, kind: JobKind, parent: Option<JobId>) -> JobId {
        let id = self.next_id;
        self.next_id += 1;
        let mut job = Job::new(id, kind);
        job.parent = parent;
        job.remove_at_end = parent.is_some();
        job.position = self.jobs.len();
        debug!(job = id, name = job.name(), "job added");
        self.jobs.push(job);
        id
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_in_queue(&self, destination: &Path) -> bool {
        self.jobs.iter().any(|job| job.destination() == destination)
    }

    /// Removes a job, aborting its runner. Returns false for unknown ids.
    pub fn remove_job(&mut self, id: JobId) -> bool {
        if !self.remove_without_settle(id) {
            return false;
        }
        self.settle();
        true
    }

    fn remove_without_settle(&mut self, id: JobId) -> bool {
        let Some(index) = self.jobs.iter().position(|job| job.id == id) else {
            return false;
        };
        let job = self.jobs.remove(index);
        if !job.ended_signalled {
            self.signal_parent(&job);
        }
        debug!(job = id, "job removed");
        true
    }

    pub fn clear(&mut self) {
        while let Some(id) = self.jobs.last().map(|job| job.id) {
            self.remove_without_settle(id);
        }
        self.settle();
    }

    pub fn remove_ended(&mut self) {
        let ended: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|job| job.ended())
            .map(|job| job.id)
            .collect();
        for id in ended {
            self.remove_without_settle(id);
        }
        self.settle();
    }

    pub fn remove_finished_children(&mut self) {
        if self.drop_finished_children() {
            self.settle();
        }
    }

    fn drop_finished_children(&mut self) -> bool {
        let before = self.jobs.len();
        self.jobs
            .retain(|job| !(job.ended() && job.ended_signalled && job.remove_at_end));
        before != self.jobs.len()
    }

    /// Forgets jobs finished so far for progress purposes.
    pub fn reset_progress(&mut self) {
        self.finished = 0;
        self.push_progress();
    }

    /// Finished plus partial credit over finished plus unfinished, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        let mut unfinished = 0usize;
        let mut partial = 0.0f32;
        for job in &self.jobs {
            unfinished += job.unfinished();
            if !job.ended() {
                partial += job.progress();
            }
        }
        let denominator = self.finished + unfinished;
        if denominator == 0 {
            1.0
        } else {
            ((partial + self.finished as f32) / denominator as f32).min(1.0)
        }
    }

    /// `(ended, total)` work units over the jobs currently in the queue.
    pub fn job_counts(&self) -> (usize, usize) {
        let total: usize = self.jobs.iter().map(Job::total).sum();
        let unfinished: usize = self.jobs.iter().map(Job::unfinished).sum();
        (total.saturating_sub(unfinished), total)
    }

    pub fn take_notices(&mut self) -> Vec<QueueNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Handles every runner event already waiting. Returns whether any arrived.
    pub fn process_events(&mut self) -> bool {
        let mut any = false;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            any = true;
        }
        if any {
            self.settle();
        }
        any
    }

    /// Blocks up to `timeout` for the first event, then drains the rest.
    pub fn wait_for_events(&mut self, timeout: Duration) -> bool {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                self.process_events();
                self.settle();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.iter().all(Job::ended)
    }

    /// Drives all jobs until every one of them has ended.
    pub fn run_until_idle(&mut self) {
        self.settle();
        while !self.is_idle() {
            self.wait_for_events(IDLE_POLL);
        }
    }

    fn handle_event(&mut self, event: RunnerEvent) {
        let Some(job) = self.jobs.iter_mut().find(|job| job.id == event.runner) else {
            return;
        };
        if job.ended() {
            return;
        }
        let JobKind::Single(single) = &mut job.kind else {
            return;
        };
        if single.request != event.request {
            return;
        }

        let outcome = match event.kind {
            RunnerEventKind::Progress(percent) => {
                single.progress = percent;
                return;
            }
            RunnerEventKind::Saved { width, height } => {
                single.result_size = Some((width, height));
                Ok(())
            }
            RunnerEventKind::Delivered(bitmap) => {
                single.result_size = Some(bitmap.dimensions());
                Ok(())
            }
            RunnerEventKind::SaveFailed(message) => {
                warn!(job = event.runner, %message, "save failed");
                Err(JobErrorKind::DestinationSaveFailed)
            }
            RunnerEventKind::AllocFailed => Err(JobErrorKind::AllocFailed),
        };
        single.progress = 100;
        single.end();
        match outcome {
            Ok(()) => {
                job.status = JobStatus::Succeeded;
                job.activity = Activity::None;
            }
            Err(error) => job.fail(error),
        }
    }

    /// Re-runs the scheduling pass until nothing changes.
    fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_PASSES {
            let mut changed = self.signal_ended();
            changed |= self.drop_finished_children();
            changed |= self.assign_activities();
            if !changed {
                break;
            }
        }
        self.push_progress();
    }

    fn assign_activities(&mut self) -> bool {
        let mut changed = false;
        let mut slots = ACTIVE_SLOTS - 1;
        let mut spawned: Vec<(JobId, SingleImageJob)> = Vec::new();
        let events = &self.events_tx;
        let notices = &mut self.notices;

        for (position, job) in self.jobs.iter_mut().enumerate() {
            job.position = position;
            if job.ended() {
                continue;
            }
            let activity = if slots == ACTIVE_SLOTS - 1 {
                Activity::High
            } else if slots == ACTIVE_SLOTS - 2 {
                Activity::Middle
            } else if slots >= 0 {
                Activity::Low
            } else {
                Activity::None
            };
            changed |= apply_activity(job, activity, events, notices, &mut spawned);
            slots -= job.threads_used();
        }

        for (parent, child) in spawned {
            self.push(JobKind::Single(child), Some(parent));
            changed = true;
        }
        changed
    }

    /// Emits the one-time "ended" notices and informs parent batches.
    fn signal_ended(&mut self) -> bool {
        let mut ended = Vec::new();
        for job in self.jobs.iter_mut() {
            if job.ended() && !job.ended_signalled {
                job.ended_signalled = true;
                ended.push(job.id);
            }
        }
        for &id in &ended {
            let Some(job) = self.jobs.iter().find(|job| job.id == id) else {
                continue;
            };
            let (notice, failed) = ended_notice(job);
            let counts = matches!(job.kind, JobKind::Single(_));
            let parent = job.parent;
            if counts {
                self.finished += 1;
            }
            self.notices.push(notice);
            if let Some(parent) = parent {
                self.child_ended(parent, failed);
            }
        }
        !ended.is_empty()
    }

    fn signal_parent(&mut self, job: &Job) {
        if let Some(parent) = job.parent {
            self.child_ended(parent, job.status == JobStatus::Failed);
        }
    }

    fn child_ended(&mut self, parent: JobId, failed: bool) {
        if let Some(JobKind::Batch(batch)) = self
            .jobs
            .iter_mut()
            .find(|job| job.id == parent)
            .map(|job| &mut job.kind)
        {
            batch.child_ended(failed);
        }
    }

    fn push_progress(&mut self) {
        let percent = (self.progress() * 100.0) as u8;
        let (ended, total) = self.job_counts();
        self.notices.push(QueueNotice::Progress(percent));
        self.notices.push(QueueNotice::JobCount { ended, total });
    }
}

fn apply_activity(
    job: &mut Job,
    activity: Activity,
    events: &Sender<RunnerEvent>,
    notices: &mut Vec<QueueNotice>,
    spawned: &mut Vec<(JobId, SingleImageJob)>,
) -> bool {
    let previous = (job.activity, job.status);
    let spawned_before = spawned.len();
    match &mut job.kind {
        JobKind::Single(single) => {
            if !single.has_runner() && activity != Activity::None {
                match single.start(job.id, events) {
                    Ok(message) => {
                        job.status = JobStatus::Running;
                        notices.push(QueueNotice::Status {
                            job: job.id,
                            message,
                        });
                    }
                    Err(error) => {
                        job.fail(error);
                        return true;
                    }
                }
            }
            single.set_runner_activity(activity);
            job.activity = activity;
        }
        JobKind::Batch(batch) => {
            batch.apply_activity(activity);
            job.activity = activity;
            if batch.is_complete() {
                info!(job = job.id, name = %batch.name, "batch finished");
                job.status = JobStatus::Succeeded;
                job.activity = Activity::None;
                batch.apply_activity(Activity::None);
            } else {
                while let Some(child) = batch.next_child() {
                    spawned.push((job.id, child));
                    if job.status == JobStatus::NotStarted {
                        job.status = JobStatus::Running;
                    }
                }
            }
        }
    }
    previous != (job.activity, job.status) || spawned.len() != spawned_before
}

fn ended_notice(job: &Job) -> (QueueNotice, bool) {
    let failed = job.status == JobStatus::Failed;
    if failed {
        warn!(job = job.id, name = job.name(), error = ?job.error(), "job failed");
        let message = format!("ERROR calculating '{}'. {}", job.name(), job.detailed_status_string());
        return (QueueNotice::Error { job: job.id, message }, true);
    }
    let message = match &job.kind {
        JobKind::Single(single) => {
            info!(job = job.id, name = %single.name, "job finished");
            let (width, height) = single.result_size.unwrap_or_default();
            format!(
                "Finished '{}'. Saved to '{}'. ( Size: {}x{} )",
                single.name,
                single.destination.display(),
                width,
                height
            )
        }
        JobKind::Batch(batch) => format!(
            "Finished folder '{}'. Saved to '{}'.",
            batch.name,
            batch.destination_dir.display()
        ),
    };
    (QueueNotice::Status { job: job.id, message }, false)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::color::Bitmap;
    use crate::format::TargetSpec;
    use crate::params::EnlargeParams;
    use crate::pixel::Rgb;
    use crate::plane::Plane;

    fn image_job(dir: &Path, name: &str, size: usize) -> SingleImageJob {
        let image = Arc::new(Bitmap::Rgb(Plane::filled(size, size, Rgb::splat(0.4))));
        SingleImageJob::new(
            dir.join("unused.png"),
            dir.join(name),
            TargetSpec::zoom(2.0),
            EnlargeParams::default(),
            90,
        )
        .with_image(image)
    }

    fn activities(queue: &JobQueue) -> Vec<Activity> {
        queue.jobs().iter().map(Job::activity).collect()
    }

    #[test]
    fn priorities_follow_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = JobQueue::new();
        for n in 0..5 {
            queue.add_job(image_job(dir.path(), &format!("{n}.png"), 64));
        }
        assert_eq!(
            activities(&queue),
            [
                Activity::High,
                Activity::Middle,
                Activity::Low,
                Activity::None,
                Activity::None
            ]
        );
        let first = queue.jobs()[0].id();
        queue.remove_job(first);
        assert_eq!(
            activities(&queue),
            [Activity::High, Activity::Middle, Activity::Low, Activity::None]
        );
        queue.clear();
    }

    #[test]
    fn missing_source_fails_and_promotes_the_next_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = JobQueue::new();
        let missing = queue.add_job(SingleImageJob::new(
            dir.path().join("nope.png"),
            dir.path().join("nope_e.png"),
            TargetSpec::zoom(2.0),
            EnlargeParams::default(),
            90,
        ));
        queue.add_job(image_job(dir.path(), "ok.png", 8));

        let failed = queue.job(missing).unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(failed.error(), Some(JobErrorKind::SourceNotFound));
        assert_eq!(queue.jobs()[1].activity(), Activity::High);
        assert!(queue
            .take_notices()
            .iter()
            .any(|n| matches!(n, QueueNotice::Error { job, .. } if *job == missing)));
    }

    #[test]
    fn single_job_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = JobQueue::new();
        let id = queue.add_job(image_job(dir.path(), "out.png", 12));
        assert!(queue.is_in_queue(&dir.path().join("out.png")));
        queue.run_until_idle();

        let job = queue.job(id).unwrap();
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.status_string(), " [ finished ] ");
        assert_eq!(queue.job_counts(), (1, 1));
        assert_eq!(queue.progress(), 1.0);
        assert!(dir.path().join("out.png").exists());

        queue.remove_ended();
        assert!(queue.is_empty());
        queue.reset_progress();
        assert_eq!(queue.progress(), 1.0);
    }

    #[test]
    fn empty_queue_reports_full_progress() {
        let queue = JobQueue::new();
        assert_eq!(queue.progress(), 1.0);
        assert_eq!(queue.job_counts(), (0, 0));
        assert!(queue.is_idle());
    }
}
