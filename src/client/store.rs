//! Client-side state of upload groups and their files.
//!
//! Every mutation goes through [`UploadStore::update`], which applies the
//! change under one lock and then recomputes every group's derived fields
//! from its files. Completion callbacks run after the lock is released.

use serde::Serialize;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{
    cancel::{AbortReason, CancelHandle},
    transport::{MAX_UNCONFIRMED_PROGRESS, UploadSource},
};
use crate::models::artifact::ArtifactMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Ready,
    Uploading,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Ready,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl GroupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown group `{0}`")]
    UnknownGroup(String),
    #[error("unknown file `{0}`")]
    UnknownFile(String),
    #[error("file `{file_id}` cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        file_id: String,
        from: FileStatus,
        to: FileStatus,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Also used as the server-side `uploadId`.
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub path: PathBuf,
    pub status: FileStatus,
    pub progress: f64,
    pub total_chunks: u32,
    /// Last confirmed chunk + 1.
    pub uploaded_chunk_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ArtifactMetadata>,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    #[serde(skip)]
    upload_time: Duration,
    #[serde(skip)]
    running_since: Option<Instant>,
    #[serde(skip)]
    cancel: CancelHandle,
}

impl FileEntry {
    pub fn source(&self) -> UploadSource {
        UploadSource {
            path: self.path.clone(),
            file_name: self.name.clone(),
            file_type: self.mime_type.clone(),
            file_size: self.size,
        }
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.upload_time
            + self
                .running_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default()
    }

    fn begin_run(&mut self, now: Instant) -> CancelHandle {
        self.status = FileStatus::Uploading;
        self.error = None;
        self.running_since = Some(now);
        self.cancel = CancelHandle::new();
        self.cancel.clone()
    }

    fn end_run(&mut self, status: FileStatus, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.upload_time += now.saturating_duration_since(since);
        }
        self.status = status;
    }

    fn transition_error(&self, to: FileStatus) -> StoreError {
        StoreError::InvalidTransition {
            file_id: self.id.clone(),
            from: self.status,
            to,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEntry {
    pub id: String,
    pub name: String,
    pub status: GroupStatus,
    pub progress: f64,
    pub completed_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    pub file_ids: Vec<String>,
    #[serde(skip)]
    cancelled: bool,
    #[serde(skip)]
    started_at: Option<Instant>,
    #[serde(skip)]
    notified: bool,
}

/// A group together with its files, as handed to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    #[serde(flatten)]
    pub group: GroupEntry,
    pub files: Vec<FileEntry>,
}

/// Derived totals across every file in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreTotals {
    pub total_progress: f64,
    pub uploaded_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
}

/// Invoked once each time a group enters a terminal status.
pub type GroupCallback = Arc<dyn Fn(&GroupSnapshot) + Send + Sync>;

/// Group progress: completed files over files that are completed or still
/// uploading, in percent; 0 when there are none.
pub fn group_progress(statuses: &[FileStatus]) -> f64 {
    let completed = statuses
        .iter()
        .filter(|s| **s == FileStatus::Completed)
        .count();
    let active = statuses
        .iter()
        .filter(|s| matches!(s, FileStatus::Completed | FileStatus::Uploading))
        .count();
    if active == 0 {
        0.0
    } else {
        completed as f64 / active as f64 * 100.0
    }
}

/// Group status from its files, in priority order: cancelled, failed,
/// then completed once nothing is left to send, else uploading.
///
/// A group with a ready or paused file is never terminal.
pub fn derive_group_status(statuses: &[FileStatus], cancelled: bool) -> GroupStatus {
    let total = statuses.len();
    let count = |status: FileStatus| statuses.iter().filter(|s| **s == status).count();
    let failed = count(FileStatus::Failed);
    let cancelled_files = count(FileStatus::Cancelled);

    if cancelled || (total > 0 && cancelled_files == total) {
        return GroupStatus::Cancelled;
    }
    if total > 0 && (failed == total || failed + cancelled_files == total) {
        return GroupStatus::Failed;
    }
    if total == 0 || count(FileStatus::Ready) == total {
        return GroupStatus::Ready;
    }
    let pending = statuses
        .iter()
        .any(|s| matches!(s, FileStatus::Ready | FileStatus::Paused));
    if !pending && group_progress(statuses) >= 100.0 {
        GroupStatus::Completed
    } else {
        GroupStatus::Uploading
    }
}

/// `(100 - p) / p * elapsed`, 0 when nothing has been sent yet.
pub fn remaining_time(progress: f64, elapsed: Duration) -> Duration {
    if progress <= 0.0 || progress >= 100.0 {
        return Duration::ZERO;
    }
    elapsed.mul_f64((100.0 - progress) / progress)
}

#[derive(Default)]
struct StoreState {
    groups: HashMap<String, GroupEntry>,
    group_order: Vec<String>,
    files: HashMap<String, FileEntry>,
    callbacks: HashMap<String, GroupCallback>,
}

impl StoreState {
    fn file_mut(&mut self, file_id: &str) -> Result<&mut FileEntry, StoreError> {
        self.files
            .get_mut(file_id)
            .ok_or_else(|| StoreError::UnknownFile(file_id.to_string()))
    }

    fn snapshot(&self, group_id: &str) -> Option<GroupSnapshot> {
        let group = self.groups.get(group_id)?;
        let files = group
            .file_ids
            .iter()
            .filter_map(|id| self.files.get(id).cloned())
            .collect();
        Some(GroupSnapshot {
            group: group.clone(),
            files,
        })
    }

    /// Recompute every derived field. Returns the groups that just became
    /// terminal and have not been reported yet.
    fn recompute(&mut self, now: Instant) -> Vec<String> {
        for file in self.files.values_mut() {
            let elapsed = file.elapsed(now);
            file.elapsed_secs = elapsed.as_secs_f64();
            file.remaining_secs = match file.status {
                FileStatus::Uploading => remaining_time(file.progress, elapsed).as_secs_f64(),
                _ => 0.0,
            };
        }

        let mut newly_terminal = Vec::new();
        for group in self.groups.values_mut() {
            let files: Vec<&FileEntry> = group
                .file_ids
                .iter()
                .filter_map(|id| self.files.get(id))
                .collect();
            let statuses: Vec<FileStatus> = files.iter().map(|f| f.status).collect();
            let count = |status: FileStatus| statuses.iter().filter(|s| **s == status).count();

            group.completed_files = count(FileStatus::Completed);
            group.failed_files = count(FileStatus::Failed);
            group.cancelled_files = count(FileStatus::Cancelled);
            group.progress = group_progress(&statuses);
            group.status = derive_group_status(&statuses, group.cancelled);

            let uploading_remaining: f64 = files
                .iter()
                .filter(|f| f.status == FileStatus::Uploading)
                .map(|f| f.remaining_secs)
                .sum();
            let outstanding = files.len().saturating_sub(group.completed_files).max(1);
            group.remaining_secs = uploading_remaining / outstanding as f64;
            group.elapsed_secs = group
                .started_at
                .map(|since| now.saturating_duration_since(since).as_secs_f64())
                .unwrap_or(0.0);

            if group.status.is_terminal() {
                if !group.notified {
                    group.notified = true;
                    newly_terminal.push(group.id.clone());
                }
            } else {
                group.notified = false;
            }
        }
        newly_terminal
    }
}

/// Shared handle to the store. Clones see the same state.
#[derive(Clone)]
pub struct UploadStore {
    state: Arc<Mutex<StoreState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for UploadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            changes: Arc::new(changes),
        }
    }

    /// A receiver that wakes after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// The single mutation path.
    fn update<R>(&self, apply: impl FnOnce(&mut StoreState, Instant) -> R) -> R {
        let (result, notify) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let result = apply(&mut state, now);
            let notify: Vec<(GroupCallback, GroupSnapshot)> = state
                .recompute(now)
                .into_iter()
                .filter_map(|group_id| {
                    let snapshot = state.snapshot(&group_id)?;
                    info!(
                        "group {} finished as {:?}",
                        snapshot.group.name, snapshot.group.status
                    );
                    let callback = state.callbacks.get(&group_id)?.clone();
                    Some((callback, snapshot))
                })
                .collect();
            (result, notify)
        };

        for (callback, snapshot) in notify {
            callback(&snapshot);
        }
        self.changes.send_modify(|version| *version += 1);
        result
    }

    fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    pub fn add_group(&self, name: impl Into<String>, on_complete: Option<GroupCallback>) -> String {
        let id = Uuid::new_v4().to_string();
        let name = name.into();
        self.update(|state, _| {
            state.groups.insert(
                id.clone(),
                GroupEntry {
                    id: id.clone(),
                    name,
                    status: GroupStatus::Ready,
                    progress: 0.0,
                    completed_files: 0,
                    failed_files: 0,
                    cancelled_files: 0,
                    elapsed_secs: 0.0,
                    remaining_secs: 0.0,
                    file_ids: Vec::new(),
                    cancelled: false,
                    started_at: None,
                    notified: false,
                },
            );
            state.group_order.push(id.clone());
            if let Some(callback) = on_complete {
                state.callbacks.insert(id.clone(), callback);
            }
        });
        id
    }

    /// Add a ready file to `group_id`. Returns the new file id.
    pub fn add_file(
        &self,
        group_id: &str,
        source: &UploadSource,
        total_chunks: u32,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.update(|state, _| {
            let group = state
                .groups
                .get_mut(group_id)
                .ok_or_else(|| StoreError::UnknownGroup(group_id.to_string()))?;
            group.file_ids.push(id.clone());
            state.files.insert(
                id.clone(),
                FileEntry {
                    id: id.clone(),
                    group_id: group_id.to_string(),
                    name: source.file_name.clone(),
                    size: source.file_size,
                    mime_type: source.file_type.clone(),
                    path: source.path.clone(),
                    status: FileStatus::Ready,
                    progress: 0.0,
                    total_chunks,
                    uploaded_chunk_index: 0,
                    error: None,
                    metadata: None,
                    elapsed_secs: 0.0,
                    remaining_secs: 0.0,
                    upload_time: Duration::ZERO,
                    running_since: None,
                    cancel: CancelHandle::new(),
                },
            );
            Ok(id.clone())
        })
    }

    /// `ready` (or `failed`, to retry) → `uploading`. Returns the handle the
    /// new run must observe.
    pub fn start_file(&self, file_id: &str) -> Result<CancelHandle, StoreError> {
        self.update(|state, now| {
            let file = state.file_mut(file_id)?;
            if !matches!(file.status, FileStatus::Ready | FileStatus::Failed) {
                return Err(file.transition_error(FileStatus::Uploading));
            }
            let handle = file.begin_run(now);
            let group_id = file.group_id.clone();
            if let Some(group) = state.groups.get_mut(&group_id) {
                group.started_at.get_or_insert(now);
            }
            Ok(handle)
        })
    }

    /// Raise the progress of an uploading file. Never lowers it; ignored in
    /// any other status.
    pub fn update_progress(&self, file_id: &str, progress: f64) -> Result<(), StoreError> {
        self.update(|state, _| {
            let file = state.file_mut(file_id)?;
            if file.status == FileStatus::Uploading {
                file.progress = file.progress.max(progress.clamp(0.0, MAX_UNCONFIRMED_PROGRESS));
            }
            Ok(())
        })
    }

    /// The server confirmed chunks up to `next_index - 1`.
    pub fn record_confirmed_chunk(
        &self,
        file_id: &str,
        next_index: u32,
        progress: f64,
    ) -> Result<(), StoreError> {
        self.update(|state, _| {
            let file = state.file_mut(file_id)?;
            if file.status == FileStatus::Uploading {
                let next = next_index.min(file.total_chunks);
                file.uploaded_chunk_index = file.uploaded_chunk_index.max(next);
                file.progress = file.progress.max(progress.clamp(0.0, MAX_UNCONFIRMED_PROGRESS));
            }
            Ok(())
        })
    }

    /// The server assembled the file. Accepted while uploading or paused
    /// (the last response may land after a pause); ignored once terminal.
    pub fn complete_file(
        &self,
        file_id: &str,
        metadata: Option<ArtifactMetadata>,
    ) -> Result<(), StoreError> {
        self.update(|state, now| {
            let file = state.file_mut(file_id)?;
            if matches!(file.status, FileStatus::Uploading | FileStatus::Paused) {
                file.end_run(FileStatus::Completed, now);
                file.progress = 100.0;
                file.uploaded_chunk_index = file.total_chunks;
                file.metadata = metadata;
                file.error = None;
            }
            Ok(())
        })
    }

    /// Permanent failure of an uploading file; ignored in any other status.
    pub fn mark_file_failed(&self, file_id: &str, error: impl Into<String>) -> Result<(), StoreError> {
        let error = error.into();
        self.update(|state, now| {
            let file = state.file_mut(file_id)?;
            if file.status == FileStatus::Uploading {
                debug!("file {} failed: {}", file.name, error);
                file.end_run(FileStatus::Failed, now);
                file.error = Some(error);
            }
            Ok(())
        })
    }

    /// `uploading` → `paused`, aborting the in-flight request. Returns
    /// `false` if the file was not uploading.
    pub fn pause_file(&self, file_id: &str) -> Result<bool, StoreError> {
        self.update(|state, now| {
            let file = state.file_mut(file_id)?;
            if file.status != FileStatus::Uploading {
                return Ok(false);
            }
            file.end_run(FileStatus::Paused, now);
            file.error = Some(AbortReason::Paused.to_string());
            file.cancel.pause();
            Ok(true)
        })
    }

    /// `paused` → `uploading` from `start_index`, usually what the server
    /// reports as its first missing chunk.
    pub fn resume_file(&self, file_id: &str, start_index: u32) -> Result<CancelHandle, StoreError> {
        self.update(|state, now| {
            let file = state.file_mut(file_id)?;
            if file.status != FileStatus::Paused {
                return Err(file.transition_error(FileStatus::Uploading));
            }
            file.uploaded_chunk_index = start_index.min(file.total_chunks);
            file.progress = if file.total_chunks == 0 {
                0.0
            } else {
                (f64::from(file.uploaded_chunk_index) / f64::from(file.total_chunks) * 100.0)
                    .min(MAX_UNCONFIRMED_PROGRESS)
            };
            Ok(file.begin_run(now))
        })
    }

    /// Cancel a file that has not finished. Returns `false` if it already
    /// had.
    pub fn cancel_file(&self, file_id: &str) -> Result<bool, StoreError> {
        self.update(|state, now| {
            let file = state.file_mut(file_id)?;
            Ok(cancel_entry(file, now))
        })
    }

    /// Cancel every unfinished file of the group and mark the group itself
    /// cancelled. Returns how many files were cancelled.
    pub fn cancel_group(&self, group_id: &str) -> Result<usize, StoreError> {
        self.update(|state, now| {
            let group = state
                .groups
                .get_mut(group_id)
                .ok_or_else(|| StoreError::UnknownGroup(group_id.to_string()))?;
            group.cancelled = true;
            let ids = group.file_ids.clone();
            let mut cancelled = 0;
            for id in ids {
                if let Some(file) = state.files.get_mut(&id) {
                    if cancel_entry(file, now) {
                        cancelled += 1;
                    }
                }
            }
            Ok(cancelled)
        })
    }

    /// Drop a file, aborting it first if it is still running.
    pub fn remove_file(&self, file_id: &str) -> Result<FileEntry, StoreError> {
        self.update(|state, _| {
            let file = state
                .files
                .remove(file_id)
                .ok_or_else(|| StoreError::UnknownFile(file_id.to_string()))?;
            file.cancel.cancel();
            if let Some(group) = state.groups.get_mut(&file.group_id) {
                group.file_ids.retain(|id| id != file_id);
            }
            Ok(file)
        })
    }

    /// Drop a group and all its files, aborting any still running.
    pub fn remove_group(&self, group_id: &str) -> Result<GroupSnapshot, StoreError> {
        self.update(|state, _| {
            let snapshot = state
                .snapshot(group_id)
                .ok_or_else(|| StoreError::UnknownGroup(group_id.to_string()))?;
            for id in &snapshot.group.file_ids {
                if let Some(file) = state.files.remove(id) {
                    file.cancel.cancel();
                }
            }
            state.groups.remove(group_id);
            state.group_order.retain(|id| id != group_id);
            state.callbacks.remove(group_id);
            Ok(snapshot)
        })
    }

    pub fn file(&self, file_id: &str) -> Option<FileEntry> {
        self.read(|state| state.files.get(file_id).cloned())
    }

    pub fn group(&self, group_id: &str) -> Option<GroupSnapshot> {
        self.read(|state| state.snapshot(group_id))
    }

    /// Every group, in creation order.
    pub fn groups(&self) -> Vec<GroupSnapshot> {
        self.read(|state| {
            state
                .group_order
                .iter()
                .filter_map(|id| state.snapshot(id))
                .collect()
        })
    }

    pub fn totals(&self) -> StoreTotals {
        self.read(|state| {
            let all = state.files.len();
            let count = |status: FileStatus| {
                state
                    .files
                    .values()
                    .filter(|f| f.status == status)
                    .count()
            };
            let uploaded_files = count(FileStatus::Completed);
            StoreTotals {
                total_progress: if all == 0 {
                    0.0
                } else {
                    uploaded_files as f64 / all as f64 * 100.0
                },
                uploaded_files,
                failed_files: count(FileStatus::Failed),
                cancelled_files: count(FileStatus::Cancelled),
            }
        })
    }
}

fn cancel_entry(file: &mut FileEntry, now: Instant) -> bool {
    if file.status.is_terminal() {
        return false;
    }
    file.end_run(FileStatus::Cancelled, now);
    file.error = Some(AbortReason::Cancelled.to_string());
    file.cancel.cancel();
    true
}
