use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::color::Bitmap;
use crate::format::{SourceClip, TargetSpec};
use crate::params::{EnlargeParams, JobConfig};
use crate::runner::{Activity, Delivery, EnlargeRequest, EnlargeRunner, RunnerEvent};
use crate::EnlargeResult;

pub type JobId = u64;

/// Extensions a directory batch picks up, compared case-insensitively.
pub const BATCH_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "bmp", "png", "tif", "tiff", "gif", "ppm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    NotStarted,
    Running,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorKind {
    AllocFailed,
    SourceNotFound,
    SourceOpenFailed,
    DestinationSaveFailed,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobErrorKind::AllocFailed => "Could not allocate enough memory.",
            JobErrorKind::SourceNotFound => "Source file not found.",
            JobErrorKind::SourceOpenFailed => "Could not open source image.",
            JobErrorKind::DestinationSaveFailed => "Could not save result.",
        };
        f.write_str(text)
    }
}

/// One entry of the [`JobQueue`](crate::queue::JobQueue).
#[derive(Debug)]
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) status: JobStatus,
    pub(crate) error: Option<JobErrorKind>,
    pub(crate) activity: Activity,
    pub(crate) position: usize,
    pub(crate) remove_at_end: bool,
    pub(crate) parent: Option<JobId>,
    pub(crate) ended_signalled: bool,
    pub(crate) kind: JobKind,
}

#[derive(Debug)]
pub enum JobKind {
    Single(SingleImageJob),
    Batch(DirectoryBatchJob),
}

impl From<SingleImageJob> for JobKind {
    fn from(job: SingleImageJob) -> Self {
        JobKind::Single(job)
    }
}

impl From<DirectoryBatchJob> for JobKind {
    fn from(job: DirectoryBatchJob) -> Self {
        JobKind::Batch(job)
    }
}

impl Job {
    pub(crate) fn new(id: JobId, kind: JobKind) -> Self {
        Self {
            id,
            status: JobStatus::NotStarted,
            error: None,
            activity: Activity::None,
            position: 0,
            remove_at_end: false,
            parent: None,
            ended_signalled: false,
            kind,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn error(&self) -> Option<JobErrorKind> {
        self.error
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remove_at_end(&self) -> bool {
        self.remove_at_end
    }

    pub fn parent(&self) -> Option<JobId> {
        self.parent
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn ended(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::Succeeded)
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            JobKind::Single(job) => &job.name,
            JobKind::Batch(job) => &job.name,
        }
    }

    pub fn destination(&self) -> &Path {
        match &self.kind {
            JobKind::Single(job) => &job.destination,
            JobKind::Batch(job) => &job.destination_dir,
        }
    }

    pub fn unfinished(&self) -> usize {
        match &self.kind {
            JobKind::Single(_) => usize::from(!self.ended()),
            JobKind::Batch(job) => job.pending.len(),
        }
    }

    pub fn total(&self) -> usize {
        match &self.kind {
            JobKind::Single(_) if self.ended() && self.remove_at_end => 0,
            JobKind::Single(_) => 1,
            JobKind::Batch(job) => job.pending.len() + job.finished,
        }
    }

    /// Completed fraction of the work still counted as unfinished.
    pub fn progress(&self) -> f32 {
        match &self.kind {
            JobKind::Single(job) => f32::from(job.progress) * 0.01,
            JobKind::Batch(_) => 0.0,
        }
    }

    /// Worker threads occupied by the job itself; batch children count on their own.
    pub fn threads_used(&self) -> i32 {
        match &self.kind {
            JobKind::Single(_) => 1,
            JobKind::Batch(_) => 0,
        }
    }

    pub fn status_string(&self) -> String {
        match &self.kind {
            JobKind::Single(job) => match self.status {
                JobStatus::NotStarted => String::new(),
                JobStatus::Failed => " [ failed ] ".to_owned(),
                JobStatus::Succeeded => " [ finished ] ".to_owned(),
                JobStatus::Running => format!(" [ {}% ] ", job.progress),
            },
            JobKind::Batch(job) => {
                let errors = match job.errors {
                    0 => String::new(),
                    1 => ", one error".to_owned(),
                    n => format!(", {n} errors"),
                };
                let total = job.total;
                match self.status {
                    JobStatus::NotStarted => String::new(),
                    JobStatus::Failed => " [ failed ] ".to_owned(),
                    JobStatus::Succeeded => {
                        format!(" [ {}/{} finished{errors} ] ", job.finished, total)
                    }
                    JobStatus::Running => format!(" [ {}/{}{errors} ] ", job.finished, total),
                }
            }
        }
    }

    pub fn detailed_status_string(&self) -> String {
        match self.status {
            JobStatus::NotStarted => "Job not started yet. ".to_owned(),
            JobStatus::Succeeded => match &self.kind {
                JobKind::Single(_) => "Job finished successfully. ".to_owned(),
                JobKind::Batch(_) => "Job finished. ".to_owned(),
            },
            JobStatus::Running => match &self.kind {
                JobKind::Single(job) => {
                    format!("Job is running ( {}% done ). ", job.progress)
                }
                JobKind::Batch(job) => format!(
                    "Job is running ( {} / {} done ). ",
                    job.finished, job.total
                ),
            },
            JobStatus::Failed => match self.error {
                Some(error) => format!("Job failed: {error} "),
                None => "Job failed. Unknown error. ".to_owned(),
            },
        }
    }

    pub fn info_string(&self) -> String {
        let (source, destination) = match &self.kind {
            JobKind::Single(job) => (&job.source, &job.destination),
            JobKind::Batch(job) => (&job.source_dir, &job.destination_dir),
        };
        format!(
            "Source:       '{}'\nDestination:  '{}'\n",
            source.display(),
            destination.display()
        )
    }

    pub(crate) fn fail(&mut self, error: JobErrorKind) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.activity = Activity::None;
    }
}

/// Enlarges one source into one destination file.
#[derive(Debug)]
pub struct SingleImageJob {
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub target: TargetSpec,
    pub clip: Option<SourceClip>,
    pub params: EnlargeParams,
    pub quality: u8,
    image: Option<Arc<Bitmap>>,
    pub(crate) runner: Option<EnlargeRunner>,
    pub(crate) request: u64,
    pub(crate) progress: u8,
    pub(crate) result_size: Option<(usize, usize)>,
}

impl SingleImageJob {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        target: TargetSpec,
        params: EnlargeParams,
        quality: u8,
    ) -> Self {
        let source = source.into();
        let destination = destination.into();
        let name = display_name(&destination);
        Self {
            name,
            source,
            destination,
            target,
            clip: None,
            params,
            quality,
            image: None,
            runner: None,
            request: 0,
            progress: 0,
            result_size: None,
        }
    }

    pub fn from_config(config: &JobConfig) -> Self {
        let mut job = Self::new(
            &config.input_path,
            config.resolved_output(),
            config.target,
            config.params,
            config.quality,
        );
        job.clip = config.clip;
        job
    }

    /// Uses an already decoded image instead of reading `source`.
    pub fn with_image(mut self, image: Arc<Bitmap>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_clip(mut self, clip: Option<SourceClip>) -> Self {
        self.clip = clip;
        self
    }

    pub fn has_runner(&self) -> bool {
        self.runner.is_some()
    }

    /// Loads the source, resolves the format and submits it to a new runner.
    ///
    /// Returns the "started" status message.
    pub(crate) fn start(
        &mut self,
        runner_id: u64,
        events: &Sender<RunnerEvent>,
    ) -> Result<String, JobErrorKind> {
        let image = match &self.image {
            Some(image) => image.clone(),
            None => {
                if !self.source.exists() {
                    warn!(source = %self.source.display(), "source not found");
                    return Err(JobErrorKind::SourceNotFound);
                }
                let image = Bitmap::load(&self.source).map_err(|err| {
                    warn!(source = %self.source.display(), error = %err, "could not open source");
                    JobErrorKind::SourceOpenFailed
                })?;
                Arc::new(image)
            }
        };

        let format = self
            .target
            .compute_format(image.width(), image.height(), self.clip);
        let mut runner = EnlargeRunner::new(runner_id, events.clone()).map_err(|err| {
            warn!(error = %err, "could not spawn runner thread");
            JobErrorKind::AllocFailed
        })?;
        runner.set_activity(Activity::None);
        self.request = runner.request(EnlargeRequest {
            source: image,
            format,
            params: self.params,
            delivery: Delivery::Save {
                path: self.destination.clone(),
                quality: self.quality,
            },
        });
        self.runner = Some(runner);
        self.progress = 0;
        info!(job = %self.name, "job started");
        Ok(format!(
            "Started '{}'. Zoom: ( {} , {} ). Result: {}x{}.",
            self.name,
            format.scale_x,
            format.scale_y,
            format.clip_width(),
            format.clip_height()
        ))
    }

    pub(crate) fn set_runner_activity(&self, activity: Activity) {
        if let Some(runner) = &self.runner {
            runner.set_activity(activity);
        }
    }

    /// Drops the runner, joining its thread.
    pub(crate) fn end(&mut self) {
        self.runner = None;
    }
}

/// Enlarges every matching file of a directory through child jobs.
#[derive(Debug)]
pub struct DirectoryBatchJob {
    pub name: String,
    pub source_dir: PathBuf,
    pub destination_dir: PathBuf,
    pub target: TargetSpec,
    pub params: EnlargeParams,
    pub quality: u8,
    pending: VecDeque<PathBuf>,
    total: usize,
    pub(crate) max_active: usize,
    pub(crate) active: usize,
    pub(crate) finished: usize,
    pub(crate) errors: usize,
}

impl DirectoryBatchJob {
    /// Snapshots the matching files of `source_dir` and creates `destination_dir`.
    ///
    /// A missing or unreadable source directory lists no files, so the batch
    /// succeeds at once with nothing done.
    pub fn new(
        source_dir: impl Into<PathBuf>,
        destination_dir: impl Into<PathBuf>,
        target: TargetSpec,
        params: EnlargeParams,
        quality: u8,
    ) -> EnlargeResult<Self> {
        let source_dir = source_dir.into();
        let destination_dir = destination_dir.into();
        fs::create_dir_all(&destination_dir)?;

        let mut entries: Vec<(String, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&source_dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(
                        dir = %source_dir.display(),
                        error = %err,
                        "skipping unreadable batch entry"
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_batch_extension(entry.path()) {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_lowercase();
            entries.push((key, entry.into_path()));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let total = entries.len();
        Ok(Self {
            name: display_name(&destination_dir),
            source_dir,
            destination_dir,
            target,
            params,
            quality,
            pending: entries.into_iter().map(|(_, path)| path).collect(),
            total,
            max_active: 0,
            active: 0,
            finished: 0,
            errors: 0,
        })
    }

    pub fn from_config(config: &JobConfig) -> EnlargeResult<Self> {
        Self::new(
            &config.input_path,
            config.resolved_output(),
            config.target,
            config.params,
            config.quality,
        )
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn finished(&self) -> usize {
        self.finished
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// Files found when the directory was listed.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.finished >= self.total
    }

    /// Updates the child cap; `Low` keeps the previous cap.
    pub(crate) fn apply_activity(&mut self, activity: Activity) {
        self.max_active = match activity {
            Activity::None => 0,
            Activity::Low => self.max_active,
            Activity::Middle => 1,
            Activity::High => 3,
        };
    }

    pub(crate) fn child_ended(&mut self, failed: bool) {
        self.active = self.active.saturating_sub(1);
        self.finished += 1;
        if failed {
            self.errors += 1;
        }
    }

    /// Takes the next file while the cap allows another child.
    pub(crate) fn next_child(&mut self) -> Option<SingleImageJob> {
        if self.active >= self.max_active {
            return None;
        }
        let source = self.pending.pop_front()?;
        let file_name = source.file_name()?.to_string_lossy().into_owned();
        let destination = self.destination_dir.join(child_file_name(&file_name));
        let mut child =
            SingleImageJob::new(source, destination, self.target, self.params, self.quality);
        child.name = format!("    {}/{}", self.name, display_name(&child.destination));
        self.active += 1;
        Some(child)
    }
}

/// `<stem>_e.<ext>`, with GIF output rewritten to PNG.
pub fn child_file_name(file_name: &str) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path.extension().map(|e| e.to_string_lossy().into_owned()) {
        Some(ext) if ext.eq_ignore_ascii_case("gif") => format!("{stem}_e.png"),
        Some(ext) => format!("{stem}_e.{ext}"),
        None => format!("{stem}_e"),
    }
}

fn has_batch_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| BATCH_EXTENSIONS.contains(&ext.as_str()))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
