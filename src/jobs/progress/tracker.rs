use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::progress::reporter::JobProgress;
use crate::jobs::progress::types::{
    Failure, FailurePolicy, Item, ItemHandle, Node, Process, Progress, Retention, Stage, Status,
};
use crate::jobs::types::{JobConfiguration, JobType};
use crate::notifications::NotificationSender;

/// Records the progress tree of one run in memory
///
/// Shared between the job body, the heartbeat and the run coordinator, so
/// all state sits behind a mutex and the flags are atomics.
pub struct RecordingJobProgress {
    job_id: String,
    job_name: String,
    job_type: JobType,
    retention: Retention,
    bucket_size: usize,
    notifications: NotificationSender,
    cancel_requested: AtomicBool,
    aborted: AtomicBool,
    skip_current_stage: AtomicBool,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    progress: Progress,
    next_item_id: u64,
    counters: StageCounters,
}

/// Per-stage counters, reset whenever a stage opens
///
/// Retention and bucketing drop or merge item nodes, so the outlier rule
/// counts successes here instead of scanning the tree.
#[derive(Default)]
struct StageCounters {
    started: usize,
    processed: usize,
    succeeded: usize,
}

impl RecordingJobProgress {
    pub fn new(job: &JobConfiguration) -> Self {
        Self {
            job_id: job.uid.clone(),
            job_name: job.name.clone(),
            job_type: job.job_type,
            retention: Retention::Full,
            bucket_size: 1,
            notifications: NotificationSender::disabled(),
            cancel_requested: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            skip_current_stage: AtomicBool::new(false),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Materialize only every `size`th work item; 0 and 1 disable bucketing
    pub fn with_bucket_size(mut self, size: usize) -> Self {
        self.bucket_size = size.max(1);
        self
    }

    pub fn with_notifications(mut self, notifications: NotificationSender) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Close every node that is still open with `status`
    ///
    /// Used by the worker after the body returned; a normal return completes
    /// the nodes the body left open, a cancelled one marks them cancelled.
    pub fn close_open_nodes(&self, status: Status) {
        let mut state = self.lock();
        for process in state
            .progress
            .processes
            .iter_mut()
            .filter(|p| !p.node.is_complete())
        {
            close_process(process, status, None);
        }
        state.progress.updated = Utc::now();
    }

    /// Record a failure that escaped the body
    ///
    /// Fails the open process, or a process named after the job when the body
    /// never opened one. Does nothing after an abort, which already reported.
    pub fn fail_run(&self, failure: Failure) {
        if self.is_aborted() {
            return;
        }
        {
            let mut state = self.lock();
            ensure_process(&mut state.progress, &self.job_id, &self.job_name);
        }
        self.failed_process(failure);
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_cancelled(&self) -> JobResult<()> {
        if self.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    fn bucketed(&self) -> bool {
        self.bucket_size > 1
    }

    fn error_subject(&self) -> String {
        format!("Job '{}' ({}) failed", self.job_name, self.job_type)
    }

    fn send_error_notification(&self, failure: &Failure) {
        if !self.job_type.uses_error_notification() {
            return;
        }
        let cause = match &failure.cause {
            Some(cause) => format!("{}: {}", failure.message, cause),
            None => failure.message.clone(),
        };
        self.notifications.error(&self.error_subject(), &cause);
    }

    /// Automatic abort after a failure under the `Fail` policy
    ///
    /// Only the first failure aborts; later ones on an already cancelled
    /// tree stay recorded on their node.
    fn abort(&self, failure: &Failure) {
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.aborted.store(true, Ordering::SeqCst);
        {
            let mut state = self.lock();
            for process in state
                .progress
                .processes
                .iter_mut()
                .filter(|p| !p.node.is_complete())
            {
                close_process(process, Status::Error, Some(failure));
            }
            state.progress.updated = Utc::now();
        }
        tracing::warn!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            error = %failure.message,
            "Job aborted"
        );
        self.send_error_notification(failure);
        self.notifications
            .notify(&self.job_id, &format!("Aborted: {}", failure.message), true);
    }

    fn complete_item(&self, id: Option<u64>, summary: Option<&str>) {
        let mut state = self.lock();
        let TrackerState {
            progress, counters, ..
        } = &mut *state;
        let Some(stage) = progress.open_process_mut().and_then(|p| p.open_stage_mut()) else {
            return;
        };
        let Some(item) = find_item(stage, id) else {
            return;
        };
        if self.bucketed() {
            counters.processed += 1;
            counters.succeeded += 1;
            item.node.summary = Some(counters.processed.to_string());
            if counters.processed % self.bucket_size == 0 {
                settle_item(item);
            }
        } else if item.node.complete(Status::Success, summary) {
            counters.succeeded += 1;
        }
        progress.updated = Utc::now();
    }

    fn fail_item(&self, id: Option<u64>, failure: Failure) {
        let (policy, has_success) = {
            let mut state = self.lock();
            let TrackerState {
                progress, counters, ..
            } = &mut *state;
            let Some(stage) = progress.open_process_mut().and_then(|p| p.open_stage_mut()) else {
                return;
            };
            let Some(item) = find_item(stage, id) else {
                return;
            };
            if self.bucketed() {
                // the bucket node is shared; it stays open and closes as an
                // error once its last slot is processed
                counters.processed += 1;
                item.node.error = Some(failure.message.clone());
                item.node.cause = failure.cause.clone();
                item.node.summary = Some(counters.processed.to_string());
                if counters.processed % self.bucket_size == 0 {
                    settle_item(item);
                }
            } else if !item.node.fail(&failure) {
                return;
            }
            let policy = item.node.on_failure;
            progress.updated = Utc::now();
            (policy, counters.succeeded > 0)
        };

        tracing::debug!(
            job_id = %self.job_id,
            policy = ?policy,
            error = %failure.message,
            "Work item failed"
        );

        match policy {
            FailurePolicy::SkipItem => {}
            FailurePolicy::SkipItemOutlier if has_success => {}
            FailurePolicy::SkipStage => self.failed_stage(failure),
            FailurePolicy::SkipItemOutlier | FailurePolicy::Fail | FailurePolicy::Parent => {
                self.abort(&failure)
            }
        }
    }
}

fn find_item(stage: &mut Stage, id: Option<u64>) -> Option<&mut Item> {
    match id {
        Some(id) => stage
            .items
            .iter_mut()
            .rev()
            .find(|item| item.id == id && !item.node.is_complete()),
        None => stage.open_item_mut(),
    }
}

/// Close an item that may carry a recorded bucket failure
///
/// Returns true when the item was open and closed as a success.
fn settle_item(item: &mut Item) -> bool {
    let status = if item.node.error.is_some() {
        Status::Error
    } else {
        Status::Success
    };
    item.node.complete(status, None) && status == Status::Success
}

fn close_stage(stage: &mut Stage, status: Status, failure: Option<&Failure>) {
    for item in stage.items.iter_mut().filter(|i| !i.node.is_complete()) {
        close_node(&mut item.node, status, failure);
    }
    close_node(&mut stage.node, status, failure);
}

fn close_process(process: &mut Process, status: Status, failure: Option<&Failure>) {
    for stage in process.stages.iter_mut().filter(|s| !s.node.is_complete()) {
        close_stage(stage, status, failure);
    }
    close_node(&mut process.node, status, failure);
}

fn close_node(node: &mut Node, status: Status, failure: Option<&Failure>) {
    match (status, failure) {
        (Status::Error, Some(failure)) => {
            node.fail(failure);
        }
        _ => {
            node.complete(status, None);
        }
    }
}

/// Opens an implicit process when the body starts a stage or item without one
fn ensure_process<'a>(
    progress: &'a mut Progress,
    job_id: &str,
    description: &str,
) -> Option<&'a mut Process> {
    if progress.open_process().is_none() {
        progress.processes.push(Process {
            node: Node::new(description, FailurePolicy::Fail),
            job_id: job_id.to_string(),
            stages: Vec::new(),
        });
    }
    progress.open_process_mut()
}

impl JobProgress for RecordingJobProgress {
    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn is_skip_current_stage(&self) -> bool {
        self.skip_current_stage.load(Ordering::SeqCst) || self.is_cancelled()
    }

    fn request_cancellation(&self) -> bool {
        let first = !self.cancel_requested.swap(true, Ordering::SeqCst);
        if first {
            tracing::info!(job_id = %self.job_id, job_type = %self.job_type, "Cancellation requested");
        }
        first
    }

    fn starting_process(&self, description: &str) -> JobResult<()> {
        self.check_cancelled()?;
        {
            let mut state = self.lock();
            if let Some(open) = state.progress.open_process_mut() {
                close_process(open, Status::Success, None);
            }
            if self.retention == Retention::Transient {
                state.progress.processes.retain(|p| !p.node.is_success());
            }
            state.progress.processes.push(Process {
                node: Node::new(description, FailurePolicy::Fail),
                job_id: self.job_id.clone(),
                stages: Vec::new(),
            });
            state.counters = StageCounters::default();
            state.progress.updated = Utc::now();
        }
        self.skip_current_stage.store(false, Ordering::SeqCst);
        self.notifications.notify(&self.job_id, description, false);
        Ok(())
    }

    fn completed_process(&self, summary: Option<&str>) {
        let description = {
            let mut state = self.lock();
            let Some(process) = state.progress.open_process_mut() else {
                return;
            };
            for stage in process.stages.iter_mut().filter(|s| !s.node.is_complete()) {
                close_stage(stage, Status::Success, None);
            }
            process.node.complete(Status::Success, summary);
            let description = process.node.description.clone();
            state.progress.updated = Utc::now();
            description
        };
        let message = summary.unwrap_or(&description);
        self.notifications.notify(&self.job_id, message, true);
    }

    fn failed_process(&self, failure: Failure) {
        {
            let mut state = self.lock();
            let Some(process) = state.progress.open_process_mut() else {
                return;
            };
            close_process(process, Status::Error, Some(&failure));
            state.progress.updated = Utc::now();
        }
        tracing::warn!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            error = %failure.message,
            "Process failed"
        );
        self.send_error_notification(&failure);
        self.notifications
            .notify(&self.job_id, &format!("Failed: {}", failure.message), true);
    }

    fn starting_stage(
        &self,
        description: &str,
        work_items: usize,
        on_failure: FailurePolicy,
    ) -> JobResult<()> {
        self.check_cancelled()?;
        {
            let mut state = self.lock();
            let retention = self.retention;
            let Some(process) = ensure_process(&mut state.progress, &self.job_id, description)
            else {
                return Ok(());
            };
            if let Some(open) = process.open_stage_mut() {
                close_stage(open, Status::Success, None);
            }
            if retention == Retention::Transient {
                process.stages.retain(|s| !s.node.is_success());
            }
            let policy = on_failure.or_parent(process.node.on_failure);
            process.stages.push(Stage {
                node: Node::new(description, policy),
                total_items: work_items,
                items: Vec::new(),
            });
            state.counters = StageCounters::default();
            state.progress.updated = Utc::now();
        }
        self.skip_current_stage.store(false, Ordering::SeqCst);
        self.notifications.notify(&self.job_id, description, false);
        Ok(())
    }

    fn completed_stage(&self, summary: Option<&str>) {
        let mut state = self.lock();
        let Some(stage) = state
            .progress
            .open_process_mut()
            .and_then(|p| p.open_stage_mut())
        else {
            return;
        };
        for item in stage.items.iter_mut().filter(|i| !i.node.is_complete()) {
            settle_item(item);
        }
        stage.node.complete(Status::Success, summary);
        state.progress.updated = Utc::now();
    }

    fn failed_stage(&self, failure: Failure) {
        let policy = {
            let mut state = self.lock();
            let Some(stage) = state
                .progress
                .open_process_mut()
                .and_then(|p| p.open_stage_mut())
            else {
                return;
            };
            close_stage(stage, Status::Error, Some(&failure));
            let policy = stage.node.on_failure;
            state.progress.updated = Utc::now();
            policy
        };
        match policy {
            FailurePolicy::Fail | FailurePolicy::Parent => self.abort(&failure),
            _ => self.skip_current_stage.store(true, Ordering::SeqCst),
        }
    }

    fn starting_work_item(
        &self,
        description: &str,
        on_failure: FailurePolicy,
    ) -> JobResult<ItemHandle> {
        self.check_cancelled()?;
        let mut state = self.lock();
        let TrackerState {
            progress,
            next_item_id,
            counters,
        } = &mut *state;

        let Some(process) = ensure_process(progress, &self.job_id, description) else {
            return Err(JobError::ExecutionFailed("no open process".to_string()));
        };
        if process.open_stage().is_none() {
            let policy = FailurePolicy::Parent.or_parent(process.node.on_failure);
            process.stages.push(Stage {
                node: Node::new(description, policy),
                total_items: 0,
                items: Vec::new(),
            });
            *counters = StageCounters::default();
        }
        let Some(stage) = process.open_stage_mut() else {
            return Err(JobError::ExecutionFailed("no open stage".to_string()));
        };

        counters.started += 1;
        let opens_bucket = (counters.started - 1) % self.bucket_size == 0;
        if self.bucketed() && !opens_bucket {
            if let Some(item) = stage.open_item_mut() {
                return Ok(ItemHandle(item.id));
            }
        }

        if let Some(open) = stage.open_item_mut()
            && settle_item(open)
            && !self.bucketed()
        {
            counters.succeeded += 1;
        }
        if self.retention == Retention::Transient {
            stage.items.retain(|i| !i.node.is_success());
        }
        let id = *next_item_id;
        *next_item_id += 1;
        let policy = on_failure.or_parent(stage.node.on_failure);
        stage.items.push(Item {
            id,
            node: Node::new(description, policy),
        });
        progress.updated = Utc::now();
        Ok(ItemHandle(id))
    }

    fn completed_work_item(&self, summary: Option<&str>) {
        self.complete_item(None, summary);
    }

    fn completed_work_item_at(&self, item: ItemHandle, summary: Option<&str>) {
        self.complete_item(Some(item.0), summary);
    }

    fn failed_work_item(&self, failure: Failure) {
        self.fail_item(None, failure);
    }

    fn failed_work_item_at(&self, item: ItemHandle, failure: Failure) {
        self.fail_item(Some(item.0), failure);
    }

    fn snapshot(&self) -> Progress {
        self.lock().progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationEvent;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn job(job_type: JobType) -> JobConfiguration {
        JobConfiguration::new("test job", job_type).with_uid("job-1")
    }

    fn tracker() -> RecordingJobProgress {
        RecordingJobProgress::new(&job(JobType::Test))
    }

    fn tracker_with_events(
        job_type: JobType,
    ) -> (RecordingJobProgress, UnboundedReceiver<NotificationEvent>) {
        let (sender, rx) = NotificationSender::channel();
        let tracker = RecordingJobProgress::new(&job(job_type)).with_notifications(sender);
        (tracker, rx)
    }

    fn error_events(rx: &mut UnboundedReceiver<NotificationEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, NotificationEvent::Error { .. }) {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn test_happy_path_builds_tree() {
        let progress = tracker();
        progress.starting_process("import").unwrap();
        progress
            .starting_stage("read", 2, FailurePolicy::Parent)
            .unwrap();
        progress
            .starting_work_item("a", FailurePolicy::Parent)
            .unwrap();
        progress.completed_work_item(Some("ok"));
        progress
            .starting_work_item("b", FailurePolicy::Parent)
            .unwrap();
        progress.completed_work_item(None);
        progress.completed_stage(Some("2 read"));
        progress.completed_process(None);

        let tree = progress.snapshot();
        assert_eq!(tree.processes.len(), 1);
        let process = &tree.processes[0];
        assert_eq!(process.node.status, Status::Success);
        assert_eq!(process.job_id, "job-1");
        assert_eq!(process.stages[0].total_items, 2);
        assert_eq!(process.stages[0].node.summary.as_deref(), Some("2 read"));
        assert_eq!(process.stages[0].items.len(), 2);
        assert_eq!(process.stages[0].items[0].node.summary.as_deref(), Some("ok"));
        assert!(tree.is_complete());
    }

    #[test]
    fn test_new_stage_auto_completes_previous_stage() {
        let progress = tracker();
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("one", 0, FailurePolicy::Parent)
            .unwrap();
        progress
            .starting_work_item("item", FailurePolicy::Parent)
            .unwrap();
        progress
            .starting_stage("two", 0, FailurePolicy::Parent)
            .unwrap();

        let tree = progress.snapshot();
        let stages = &tree.processes[0].stages;
        assert_eq!(stages[0].node.status, Status::Success);
        assert_eq!(stages[0].items[0].node.status, Status::Success);
        assert_eq!(stages[1].node.status, Status::Running);
        assert!(!tree.processes[0].node.is_complete());
    }

    #[test]
    fn test_stage_without_process_opens_implicit_process() {
        let progress = tracker();
        progress
            .starting_stage("lonely", 0, FailurePolicy::Parent)
            .unwrap();
        let tree = progress.snapshot();
        assert_eq!(tree.processes.len(), 1);
        assert_eq!(tree.processes[0].node.description, "lonely");
    }

    #[test]
    fn test_fail_policy_aborts_whole_run() {
        let (progress, mut rx) = tracker_with_events(JobType::Test);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::Parent)
            .unwrap();
        progress
            .starting_work_item("i", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("broken"));

        assert!(progress.is_cancelled());
        assert!(progress.is_aborted());
        let tree = progress.snapshot();
        let process = &tree.processes[0];
        assert_eq!(process.node.status, Status::Error);
        assert_eq!(process.stages[0].node.status, Status::Error);
        assert_eq!(process.stages[0].items[0].node.error.as_deref(), Some("broken"));
        assert!(tree.is_complete());
        assert_eq!(error_events(&mut rx), 1);

        assert!(matches!(
            progress.starting_stage("next", 0, FailurePolicy::Parent),
            Err(JobError::Cancelled)
        ));
    }

    #[test]
    fn test_second_failure_does_not_abort_again() {
        let (progress, mut rx) = tracker_with_events(JobType::Test);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::SkipItem)
            .unwrap();
        let first = progress
            .starting_work_item("a", FailurePolicy::Fail)
            .unwrap();
        let second = progress
            .starting_work_item("b", FailurePolicy::Fail)
            .unwrap();
        // "a" was auto-completed when "b" started, so only "b" can fail
        progress.failed_work_item_at(first, Failure::new("late"));
        progress.failed_work_item_at(second, Failure::new("first failure"));
        progress.failed_work_item(Failure::new("after abort"));
        progress.failed_process(Failure::new("process"));

        assert_eq!(error_events(&mut rx), 1);
        let tree = progress.snapshot();
        assert_eq!(tree.processes[0].node.error.as_deref(), Some("first failure"));
    }

    #[test]
    fn test_failure_after_user_cancellation_is_recorded_without_abort() {
        let (progress, mut rx) = tracker_with_events(JobType::Test);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::Parent)
            .unwrap();
        progress
            .starting_work_item("i", FailurePolicy::Parent)
            .unwrap();
        assert!(progress.request_cancellation());
        assert!(!progress.request_cancellation());
        progress.failed_work_item(Failure::new("boom"));

        assert!(!progress.is_aborted());
        assert_eq!(error_events(&mut rx), 0);
        let tree = progress.snapshot();
        assert_eq!(tree.processes[0].stages[0].items[0].node.status, Status::Error);
        assert!(!tree.processes[0].node.is_complete());
    }

    #[test]
    fn test_skip_stage_policy_keeps_process_open() {
        let progress = tracker();
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 3, FailurePolicy::SkipStage)
            .unwrap();
        progress
            .starting_work_item("i", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("bad item"));

        assert!(progress.is_skip_current_stage());
        assert!(!progress.is_cancelled());
        let tree = progress.snapshot();
        assert_eq!(tree.processes[0].stages[0].node.status, Status::Error);
        assert!(!tree.processes[0].node.is_complete());

        progress
            .starting_stage("next", 0, FailurePolicy::Parent)
            .unwrap();
        assert!(!progress.is_skip_current_stage());
    }

    #[test]
    fn test_skip_item_only_fails_the_item() {
        let progress = tracker();
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::SkipItem)
            .unwrap();
        progress
            .starting_work_item("i", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("bad"));

        assert!(!progress.is_skip_current_stage());
        let tree = progress.snapshot();
        assert_eq!(tree.processes[0].stages[0].node.status, Status::Running);
        assert_eq!(tree.processes[0].stages[0].items[0].node.status, Status::Error);
    }

    #[test]
    fn test_skip_item_outlier_escalates_without_prior_success() {
        let progress = tracker();
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::SkipItemOutlier)
            .unwrap();
        progress
            .starting_work_item("first", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("bad"));
        assert!(progress.is_aborted());
    }

    #[test]
    fn test_skip_item_outlier_tolerates_failure_after_success() {
        let progress = tracker();
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::SkipItemOutlier)
            .unwrap();
        progress
            .starting_work_item("ok", FailurePolicy::Parent)
            .unwrap();
        progress.completed_work_item(None);
        progress
            .starting_work_item("bad", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("outlier"));

        assert!(!progress.is_aborted());
        assert!(!progress.is_cancelled());
    }

    #[test]
    fn test_skip_item_outlier_counts_success_dropped_by_transient_retention() {
        let progress =
            RecordingJobProgress::new(&job(JobType::Test)).with_retention(Retention::Transient);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::SkipItemOutlier)
            .unwrap();
        progress
            .starting_work_item("ok", FailurePolicy::Parent)
            .unwrap();
        progress.completed_work_item(None);
        progress
            .starting_work_item("bad", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("outlier"));

        assert!(!progress.is_aborted());
        assert!(!progress.is_cancelled());
        let tree = progress.snapshot();
        let names: Vec<_> = tree.processes[0].stages[0]
            .items
            .iter()
            .map(|i| i.node.description.as_str())
            .collect();
        assert_eq!(names, vec!["bad"]);
    }

    #[test]
    fn test_skip_item_outlier_success_count_resets_per_stage() {
        let progress =
            RecordingJobProgress::new(&job(JobType::Test)).with_retention(Retention::Transient);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("one", 0, FailurePolicy::SkipItemOutlier)
            .unwrap();
        progress
            .starting_work_item("ok", FailurePolicy::Parent)
            .unwrap();
        progress.completed_work_item(None);
        progress
            .starting_stage("two", 0, FailurePolicy::SkipItemOutlier)
            .unwrap();
        progress
            .starting_work_item("bad", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("first item of the stage"));

        assert!(progress.is_aborted());
    }

    #[test]
    fn test_skip_item_outlier_inside_open_bucket() {
        let progress = RecordingJobProgress::new(&job(JobType::Test)).with_bucket_size(5);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 10, FailurePolicy::SkipItemOutlier)
            .unwrap();
        for n in 0..3 {
            progress
                .starting_work_item(&format!("item {n}"), FailurePolicy::Parent)
                .unwrap();
            progress.completed_work_item(None);
        }
        progress
            .starting_work_item("item 3", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("outlier"));
        assert!(!progress.is_aborted());

        // the shared bucket keeps counting until its fifth slot
        let tree = progress.snapshot();
        let bucket = &tree.processes[0].stages[0].items[0];
        assert!(!bucket.node.is_complete());
        assert_eq!(bucket.node.summary.as_deref(), Some("4"));

        for n in 4..10 {
            progress
                .starting_work_item(&format!("item {n}"), FailurePolicy::Parent)
                .unwrap();
            progress.completed_work_item(None);
        }
        progress.completed_stage(None);

        let tree = progress.snapshot();
        let items = &tree.processes[0].stages[0].items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].node.status, Status::Error);
        assert_eq!(items[0].node.error.as_deref(), Some("outlier"));
        assert_eq!(items[0].node.summary.as_deref(), Some("5"));
        assert_eq!(items[1].node.status, Status::Success);
        assert_eq!(items[1].node.summary.as_deref(), Some("10"));
    }

    #[test]
    fn test_failed_process_notifies_once_when_type_uses_notifications() {
        let (progress, mut rx) = tracker_with_events(JobType::DataSync);
        progress.starting_process("p").unwrap();
        progress.failed_process(Failure::new("down").with_cause("timeout"));
        progress.failed_process(Failure::new("again"));
        assert_eq!(error_events(&mut rx), 1);

        let (progress, mut rx) = tracker_with_events(JobType::Housekeeping);
        progress.starting_process("p").unwrap();
        progress.failed_process(Failure::new("down"));
        assert_eq!(error_events(&mut rx), 0);
    }

    #[test]
    fn test_fail_run_without_process_records_one() {
        let (progress, mut rx) = tracker_with_events(JobType::DataSync);
        progress.fail_run(Failure::new("connection refused"));

        let tree = progress.snapshot();
        assert_eq!(tree.processes.len(), 1);
        assert_eq!(tree.processes[0].node.description, "test job");
        assert_eq!(tree.processes[0].node.status, Status::Error);
        assert_eq!(error_events(&mut rx), 1);
    }

    #[test]
    fn test_fail_run_after_abort_is_silent() {
        let (progress, mut rx) = tracker_with_events(JobType::DataSync);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::Fail)
            .unwrap();
        progress.failed_stage(Failure::new("broken"));
        assert!(progress.is_aborted());

        progress.fail_run(Failure::new("later"));
        assert_eq!(error_events(&mut rx), 1);
    }

    #[test]
    fn test_cancellation_observed_at_starting_calls() {
        let progress = tracker();
        progress.starting_process("p").unwrap();
        progress.request_cancellation();
        assert!(matches!(
            progress.starting_process("q"),
            Err(JobError::Cancelled)
        ));
        assert!(matches!(
            progress.starting_work_item("i", FailurePolicy::Parent),
            Err(JobError::Cancelled)
        ));
        assert!(progress.is_skip_current_stage());

        progress.close_open_nodes(Status::Cancelled);
        let tree = progress.snapshot();
        assert_eq!(tree.processes[0].node.status, Status::Cancelled);
    }

    #[test]
    fn test_non_null_stage_post_condition() {
        let progress: Arc<dyn JobProgress> = Arc::new(
            RecordingJobProgress::new(&job(JobType::Test)),
        );
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::SkipStage)
            .unwrap();
        assert_eq!(progress.non_null_stage_post_condition(Some(3)).unwrap(), 3);
        assert!(matches!(
            progress.non_null_stage_post_condition::<i32>(None),
            Err(JobError::Cancelled)
        ));
        let tree = progress.snapshot();
        assert_eq!(tree.processes[0].stages[0].node.status, Status::Error);
    }

    #[tokio::test]
    async fn test_run_stage_stops_when_stage_is_skipped() {
        let progress: Arc<dyn JobProgress> = Arc::new(tracker());
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 4, FailurePolicy::SkipStage)
            .unwrap();
        let mut seen = Vec::new();
        let go_on = progress
            .run_stage(
                1..=4,
                |n| format!("item {n}"),
                |n| {
                    seen.push(n);
                    async move {
                        if n == 2 {
                            Err(Failure::new("two"))
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await;

        assert!(go_on);
        assert_eq!(seen, vec![1, 2]);
        let tree = progress.snapshot();
        assert_eq!(tree.processes[0].stages[0].node.status, Status::Error);
    }

    #[test]
    fn test_parallel_items_close_by_handle() {
        let progress = tracker();
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::SkipItem)
            .unwrap();
        let handle = progress
            .starting_work_item("only", FailurePolicy::Parent)
            .unwrap();
        progress.completed_work_item_at(handle, Some("by handle"));
        progress.completed_work_item_at(handle, Some("ignored"));

        let tree = progress.snapshot();
        let item = &tree.processes[0].stages[0].items[0];
        assert_eq!(item.node.status, Status::Success);
        assert_eq!(item.node.summary.as_deref(), Some("by handle"));
    }

    #[test]
    fn test_bucketing_five_with_twelve_items() {
        let progress = RecordingJobProgress::new(&job(JobType::Test)).with_bucket_size(5);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 12, FailurePolicy::Parent)
            .unwrap();
        for n in 0..12 {
            progress
                .starting_work_item(&format!("item {n}"), FailurePolicy::Parent)
                .unwrap();
            progress.completed_work_item(None);
        }
        progress.completed_stage(None);

        let tree = progress.snapshot();
        let summaries: Vec<_> = tree.processes[0].stages[0]
            .items
            .iter()
            .map(|i| i.node.summary.clone().unwrap_or_default())
            .collect();
        assert_eq!(summaries, vec!["5", "10", "12"]);
        assert!(tree.processes[0].stages[0]
            .items
            .iter()
            .all(|i| i.node.status == Status::Success));
    }

    #[test]
    fn test_transient_retention_drops_successful_siblings_only() {
        let progress =
            RecordingJobProgress::new(&job(JobType::Test)).with_retention(Retention::Transient);
        progress.starting_process("p").unwrap();
        progress
            .starting_stage("s", 0, FailurePolicy::SkipItem)
            .unwrap();
        progress
            .starting_work_item("ok-1", FailurePolicy::Parent)
            .unwrap();
        progress.completed_work_item(None);
        progress
            .starting_work_item("bad", FailurePolicy::Parent)
            .unwrap();
        progress.failed_work_item(Failure::new("kept"));
        progress
            .starting_work_item("ok-2", FailurePolicy::Parent)
            .unwrap();
        progress.completed_work_item(None);
        progress
            .starting_work_item("current", FailurePolicy::Parent)
            .unwrap();

        let tree = progress.snapshot();
        let names: Vec<_> = tree.processes[0].stages[0]
            .items
            .iter()
            .map(|i| i.node.description.as_str())
            .collect();
        assert_eq!(names, vec!["bad", "current"]);
    }

    #[test]
    fn test_full_retention_keeps_everything() {
        let progress = tracker();
        progress.starting_process("p").unwrap();
        progress.completed_process(None);
        progress.starting_process("q").unwrap();
        assert_eq!(progress.snapshot().processes.len(), 2);
    }

    #[test]
    fn test_snapshot_updates_timestamp() {
        let progress = tracker();
        let before = progress.snapshot().updated;
        progress.starting_process("p").unwrap();
        assert!(progress.snapshot().updated >= before);
    }

    proptest! {
        #[test]
        fn prop_bucket_count_matches_calls(bucket in 1usize..10, calls in 0usize..60) {
            let progress = RecordingJobProgress::new(&job(JobType::Test)).with_bucket_size(bucket);
            progress.starting_process("p").unwrap();
            progress.starting_stage("s", calls, FailurePolicy::Parent).unwrap();
            for n in 0..calls {
                progress.starting_work_item(&n.to_string(), FailurePolicy::Parent).unwrap();
                progress.completed_work_item(None);
            }
            progress.completed_stage(None);

            let tree = progress.snapshot();
            let items = &tree.processes[0].stages[0].items;
            prop_assert_eq!(items.len(), calls.div_ceil(bucket));
            if bucket > 1 && calls > 0 {
                let last = items.last().and_then(|i| i.node.summary.clone());
                prop_assert_eq!(last, Some(calls.to_string()));
            }
        }
    }
}
