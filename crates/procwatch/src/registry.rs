//! Request registry - one record per tracked worker process.
//!
//! Entries are keyed by pid and kept in insertion order. Capacity is fixed at
//! creation; entries are only removed by [`Registry::expire_finished`], so a
//! coordinator without retention can exhaust it.
//!
//! Lifecycle per pid: `unknown -> (NEW) -> running -> (UPDATE) -> completed`,
//! or `running -> failed` when the worker's channel breaks first. There is no
//! way back to `unknown`: a pid reused by a new process while its old entry is
//! still present is rejected.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{ErrorCode, PipelineEntry, PipelineOp, ProgramInfo, truncate_at_boundary};
use crate::time::{Clock, SystemClock, Timeval};

/// Longest command a request record keeps, in bytes.
pub const MAX_COMMAND_LEN: usize = 255;

pub const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Running,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry is full ({capacity} entries)")]
    Full { capacity: usize },

    #[error("no process with pid {0} is tracked")]
    NotFound(i32),

    #[error("pid {0} is already tracked")]
    AlreadyTracked(i32),

    #[error("pid {0} has already finished")]
    AlreadyFinished(i32),

    #[error("cannot reserve space for {capacity} entries")]
    Allocation { capacity: usize },
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Full { .. } | Self::Allocation { .. } => ErrorCode::RegistryFull,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyTracked(_) => ErrorCode::AlreadyTracked,
            Self::AlreadyFinished(_) => ErrorCode::AlreadyFinished,
        }
    }
}

/// A tracked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pid: i32,
    /// Registration number, unique within one registry. Tells a reused pid
    /// apart from the entry it replaced.
    serial: u64,
    initial_timestamp: Timeval,
    final_timestamp: Option<Timeval>,
    command: String,
    state: RequestState,
    failure: Option<String>,
}

impl Request {
    /// A detached running record; the final timestamp is unset.
    pub fn new(pid: i32, initial_timestamp: Timeval, command: impl Into<String>) -> Self {
        let mut command = command.into();
        truncate_at_boundary(&mut command, MAX_COMMAND_LEN);
        Self {
            pid,
            serial: 0,
            initial_timestamp,
            final_timestamp: None,
            command,
            state: RequestState::Running,
            failure: None,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn initial_timestamp(&self) -> Timeval {
        self.initial_timestamp
    }

    pub fn final_timestamp(&self) -> Option<Timeval> {
        self.final_timestamp
    }

    /// `final - initial`, clamped to zero if the clock went backwards.
    pub fn elapsed(&self) -> Option<Timeval> {
        let fin = self.final_timestamp?;
        let (elapsed, negative) = fin.subtract(&self.initial_timestamp);
        Some(if negative { Timeval::default() } else { elapsed })
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            pid: self.pid,
            command: self.command.clone(),
            state: self.state,
            started_at: self.initial_timestamp,
            finished_at: self.final_timestamp,
            elapsed: self.elapsed(),
            failure: self.failure.clone(),
        }
    }

    fn complete(&mut self, at: Timeval, command: Option<&str>) {
        self.final_timestamp = Some(at);
        self.state = RequestState::Completed;
        if let Some(command) = command {
            self.command = command.to_string();
            truncate_at_boundary(&mut self.command, MAX_COMMAND_LEN);
        }
    }

    fn fail(&mut self, at: Timeval, reason: String) {
        self.final_timestamp = Some(at);
        self.state = RequestState::Failed;
        self.failure = Some(reason);
    }
}

/// Summary returned for STATUS requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub pid: i32,
    pub command: String,
    pub state: RequestState,
    pub started_at: Timeval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timeval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<Timeval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} [{}] `{}` started {}",
            self.pid,
            self.state.as_str(),
            self.command,
            self.started_at.to_rfc3339()
        )?;
        match self.elapsed {
            Some(elapsed) => write!(f, ", elapsed {elapsed}")?,
            None => write!(f, ", in progress")?,
        }
        if let Some(ref failure) = self.failure {
            write!(f, " ({failure})")?;
        }
        Ok(())
    }
}

/// Capacity-bounded, insertion-ordered store of [`Request`] records.
pub struct Registry {
    requests: IndexMap<i32, Request>,
    capacity: usize,
    next_serial: u64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.requests.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Registry {
    pub fn new(capacity: usize) -> Result<Self, RegistryError> {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    /// Reserve room for `capacity` entries up front; fails if the allocation
    /// cannot be made.
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Result<Self, RegistryError> {
        let mut requests = IndexMap::new();
        requests
            .try_reserve(capacity)
            .map_err(|_| RegistryError::Allocation { capacity })?;
        Ok(Self {
            requests,
            capacity,
            next_serial: 1,
            clock,
        })
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.requests.len() >= self.capacity
    }

    /// Append a prepared record at the end. Returns its index.
    pub fn append(&mut self, mut request: Request) -> Result<usize, RegistryError> {
        if self.requests.contains_key(&request.pid) {
            return Err(RegistryError::AlreadyTracked(request.pid));
        }
        if self.is_full() {
            return Err(RegistryError::Full {
                capacity: self.capacity,
            });
        }
        request.serial = self.next_serial;
        self.next_serial += 1;
        let (index, _) = self.requests.insert_full(request.pid, request);
        Ok(index)
    }

    /// Start tracking `info.pid`, stamped with the current time.
    pub fn insert(&mut self, info: &ProgramInfo) -> Result<usize, RegistryError> {
        let request = Request::new(info.pid, self.clock.now(), info.name.as_str());
        let index = self.append(request)?;
        tracing::debug!(pid = info.pid, index, len = self.len(), "Request inserted");
        Ok(index)
    }

    /// Index of `pid` in insertion order.
    pub fn find(&self, pid: i32) -> Option<usize> {
        self.requests.get_index_of(&pid)
    }

    pub fn get(&self, pid: i32) -> Option<&Request> {
        self.requests.get(&pid)
    }

    /// Mark `info.pid` completed now. A non-empty name replaces the command.
    pub fn update(&mut self, info: &ProgramInfo) -> Result<&Request, RegistryError> {
        let now = self.clock.now();
        let request = self
            .requests
            .get_mut(&info.pid)
            .ok_or(RegistryError::NotFound(info.pid))?;
        if request.state.is_finished() {
            return Err(RegistryError::AlreadyFinished(info.pid));
        }

        let command = (!info.name.is_empty()).then_some(info.name.as_str());
        request.complete(now, command);
        tracing::debug!(pid = info.pid, "Request completed");
        Ok(request)
    }

    pub fn status(&self, pid: i32) -> Result<StatusReport, RegistryError> {
        self.requests
            .get(&pid)
            .map(Request::status)
            .ok_or(RegistryError::NotFound(pid))
    }

    /// Mark a running entry failed. Returns `false` if it had already finished.
    pub fn mark_failed(&mut self, pid: i32, reason: impl Into<String>) -> Result<bool, RegistryError> {
        let now = self.clock.now();
        let request = self
            .requests
            .get_mut(&pid)
            .ok_or(RegistryError::NotFound(pid))?;
        if request.state.is_finished() {
            return Ok(false);
        }
        request.fail(now, reason.into());
        Ok(true)
    }

    /// Apply a batch of NEW/UPDATE entries all-or-nothing.
    ///
    /// Every entry is checked against the registry as it would look after the
    /// preceding entries; nothing is applied unless all of them pass. Returns
    /// the pids that were newly inserted.
    pub fn apply_batch(&mut self, entries: &[PipelineEntry]) -> Result<Vec<i32>, RegistryError> {
        let mut inserted: Vec<i32> = Vec::new();
        let mut completed: Vec<i32> = Vec::new();

        for entry in entries {
            let pid = entry.info.pid;
            match entry.op {
                PipelineOp::New => {
                    if self.requests.contains_key(&pid) || inserted.contains(&pid) {
                        return Err(RegistryError::AlreadyTracked(pid));
                    }
                    if self.len() + inserted.len() >= self.capacity {
                        return Err(RegistryError::Full {
                            capacity: self.capacity,
                        });
                    }
                    inserted.push(pid);
                }
                PipelineOp::Update => {
                    let finished = match self.requests.get(&pid) {
                        Some(request) => request.state.is_finished(),
                        None if inserted.contains(&pid) => false,
                        None => return Err(RegistryError::NotFound(pid)),
                    };
                    if finished || completed.contains(&pid) {
                        return Err(RegistryError::AlreadyFinished(pid));
                    }
                    completed.push(pid);
                }
            }
        }

        for entry in entries {
            match entry.op {
                PipelineOp::New => {
                    self.insert(&entry.info)?;
                }
                PipelineOp::Update => {
                    self.update(&entry.info)?;
                }
            }
        }
        Ok(inserted)
    }

    /// Drop finished entries whose final timestamp is older than `max_age`.
    /// Returns how many were removed.
    pub fn expire_finished(&mut self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let max_age = Timeval::from(max_age);
        let before = self.requests.len();

        self.requests.retain(|_, request| match request.final_timestamp {
            Some(fin) if request.state.is_finished() => {
                let (age, negative) = now.subtract(&fin);
                negative || age <= max_age
            }
            _ => true,
        });

        let removed = before - self.requests.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.requests.len(), "Expired finished requests");
        }
        removed
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.values()
    }

    pub fn statuses(&self) -> Vec<StatusReport> {
        self.iter().map(Request::status).collect()
    }

    /// Reports for `pids` in insertion order, whatever order they were asked
    /// in. Fails on the first pid that is not tracked.
    pub fn statuses_of(&self, pids: &[i32]) -> Result<Vec<StatusReport>, RegistryError> {
        if let Some(&missing) = pids.iter().find(|pid| !self.requests.contains_key(*pid)) {
            return Err(RegistryError::NotFound(missing));
        }
        Ok(self
            .iter()
            .filter(|request| pids.contains(&request.pid))
            .map(Request::status)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn info(pid: i32, name: &str) -> ProgramInfo {
        ProgramInfo::new(pid, name, 0)
    }

    fn registry_at(capacity: usize, now: Timeval) -> (Registry, Arc<ManualClock>) {
        let clock = ManualClock::starting_at(now);
        let registry = Registry::with_clock(capacity, clock.clone()).unwrap();
        (registry, clock)
    }

    #[test]
    fn create_request_leaves_final_unset() {
        let request = Request::new(9, Timeval::new(1, 2), "cmd");
        assert_eq!(request.final_timestamp(), None);
        assert_eq!(request.state(), RequestState::Running);
        assert_eq!(request.elapsed(), None);
    }

    #[test]
    fn create_request_bounds_command() {
        let request = Request::new(9, Timeval::default(), "c".repeat(300));
        assert_eq!(request.command().len(), MAX_COMMAND_LEN);
    }

    #[test]
    fn inserts_are_found_in_order() {
        let (mut registry, _) = registry_at(8, Timeval::new(100, 0));

        for (expected, pid) in [300, 12, 4096, 7].into_iter().enumerate() {
            let index = registry.insert(&info(pid, "w")).unwrap();
            assert_eq!(index, expected);
            assert_eq!(registry.find(pid), Some(expected));
            assert_eq!(registry.len(), expected + 1);
        }
        assert_eq!(registry.find(1), None);

        let pids: Vec<i32> = registry.iter().map(Request::pid).collect();
        assert_eq!(pids, vec![300, 12, 4096, 7]);
    }

    #[test]
    fn insert_beyond_capacity_fails_without_mutation() {
        let (mut registry, _) = registry_at(2, Timeval::default());
        registry.insert(&info(1, "a")).unwrap();
        registry.insert(&info(2, "b")).unwrap();

        let err = registry.insert(&info(3, "c")).unwrap_err();
        assert_eq!(err, RegistryError::Full { capacity: 2 });
        assert_eq!(err.code(), ErrorCode::RegistryFull);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(3), None);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let (mut registry, _) = registry_at(0, Timeval::default());
        assert!(registry.is_full());
        assert!(matches!(
            registry.insert(&info(1, "a")),
            Err(RegistryError::Full { capacity: 0 })
        ));
    }

    #[test]
    fn duplicate_pid_is_rejected() {
        let (mut registry, _) = registry_at(4, Timeval::default());
        registry.insert(&info(5, "first")).unwrap();

        let err = registry.insert(&info(5, "second")).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyTracked(5));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(5).unwrap().command(), "first");
    }

    #[test]
    fn update_unknown_pid_is_not_found() {
        let (mut registry, _) = registry_at(4, Timeval::default());
        registry.insert(&info(1, "a")).unwrap();
        let before = registry.statuses();

        let err = registry.update(&info(2, "b")).unwrap_err();
        assert_eq!(err, RegistryError::NotFound(2));
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(registry.statuses(), before);
    }

    #[test]
    fn update_sets_final_timestamp_and_command() {
        let (mut registry, clock) = registry_at(4, Timeval::new(10, 900_000));
        registry.insert(&info(100, "cargo test")).unwrap();

        clock.set(Timeval::new(11, 100_000));
        let request = registry.update(&info(100, "cargo test --release")).unwrap();
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(request.final_timestamp(), Some(Timeval::new(11, 100_000)));
        assert_eq!(request.command(), "cargo test --release");
    }

    #[test]
    fn update_with_empty_name_keeps_command() {
        let (mut registry, _) = registry_at(4, Timeval::default());
        registry.insert(&info(100, "make")).unwrap();
        let request = registry.update(&info(100, "")).unwrap();
        assert_eq!(request.command(), "make");
    }

    #[test]
    fn second_update_is_rejected() {
        let (mut registry, _) = registry_at(4, Timeval::default());
        registry.insert(&info(100, "make")).unwrap();
        registry.update(&info(100, "")).unwrap();
        assert_eq!(
            registry.update(&info(100, "")).unwrap_err(),
            RegistryError::AlreadyFinished(100)
        );
    }

    #[test]
    fn status_reports_running_then_elapsed() {
        let (mut registry, clock) = registry_at(4, Timeval::new(10, 900_000));
        registry.insert(&info(100, "pytest")).unwrap();

        let report = registry.status(100).unwrap();
        assert_eq!(report.state, RequestState::Running);
        assert_eq!(report.elapsed, None);
        assert!(report.to_string().ends_with("in progress"));

        clock.set(Timeval::new(11, 100_000));
        registry.update(&info(100, "")).unwrap();

        let report = registry.status(100).unwrap();
        assert_eq!(report.state, RequestState::Completed);
        assert_eq!(report.elapsed, Some(Timeval::new(0, 200_000)));
        assert_eq!(
            report.to_string(),
            "pid 100 [completed] `pytest` started 1970-01-01T00:00:10.900000Z, elapsed 0.200000s"
        );
    }

    #[test]
    fn status_unknown_pid_is_not_found() {
        let (registry, _) = registry_at(4, Timeval::default());
        assert_eq!(registry.status(999), Err(RegistryError::NotFound(999)));
    }

    #[test]
    fn elapsed_is_never_negative() {
        let (mut registry, clock) = registry_at(4, Timeval::new(50, 0));
        registry.insert(&info(1, "a")).unwrap();
        clock.set(Timeval::new(49, 0));
        registry.update(&info(1, "")).unwrap();
        assert_eq!(registry.status(1).unwrap().elapsed, Some(Timeval::default()));
    }

    #[test]
    fn mark_failed_only_affects_running_entries() {
        let (mut registry, _) = registry_at(4, Timeval::default());
        registry.insert(&info(1, "a")).unwrap();
        registry.insert(&info(2, "b")).unwrap();
        registry.update(&info(2, "")).unwrap();

        assert_eq!(registry.mark_failed(1, "channel closed"), Ok(true));
        assert_eq!(registry.mark_failed(2, "channel closed"), Ok(false));
        assert_eq!(
            registry.mark_failed(3, "channel closed"),
            Err(RegistryError::NotFound(3))
        );

        let failed = registry.status(1).unwrap();
        assert_eq!(failed.state, RequestState::Failed);
        assert_eq!(failed.failure.as_deref(), Some("channel closed"));
        assert_eq!(registry.status(2).unwrap().state, RequestState::Completed);
    }

    #[test]
    fn reused_pid_gets_a_new_serial() {
        let (mut registry, clock) = registry_at(4, Timeval::new(0, 0));
        registry.insert(&info(5, "first")).unwrap();
        registry.update(&info(5, "")).unwrap();
        let first = registry.get(5).unwrap().serial();

        clock.set(Timeval::new(100, 0));
        assert_eq!(registry.expire_finished(Duration::from_secs(10)), 1);
        registry.insert(&info(5, "second")).unwrap();

        let second = registry.get(5).unwrap().serial();
        assert_ne!(first, second);
        assert_eq!(registry.get(5).unwrap().command(), "second");
    }

    #[test]
    fn statuses_of_follows_insertion_order() {
        let (mut registry, _) = registry_at(8, Timeval::default());
        for pid in [30, 10, 20] {
            registry.insert(&info(pid, "w")).unwrap();
        }

        let pids: Vec<i32> = registry
            .statuses_of(&[20, 30])
            .unwrap()
            .iter()
            .map(|report| report.pid)
            .collect();
        assert_eq!(pids, vec![30, 20]);

        assert_eq!(
            registry.statuses_of(&[10, 99]),
            Err(RegistryError::NotFound(99))
        );
        assert_eq!(registry.statuses_of(&[]), Ok(Vec::new()));
    }

    #[test]
    fn batch_applies_all_entries() {
        let (mut registry, _) = registry_at(4, Timeval::default());
        registry.insert(&info(1, "a")).unwrap();

        let admitted = registry
            .apply_batch(&[
                PipelineEntry::new_process(info(2, "b")),
                PipelineEntry::update(info(1, "")),
                PipelineEntry::new_process(info(3, "c")),
                PipelineEntry::update(info(3, "")),
            ])
            .unwrap();

        assert_eq!(admitted, vec![2, 3]);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.status(1).unwrap().state, RequestState::Completed);
        assert_eq!(registry.status(2).unwrap().state, RequestState::Running);
        assert_eq!(registry.status(3).unwrap().state, RequestState::Completed);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (mut registry, _) = registry_at(4, Timeval::default());
        registry.insert(&info(1, "a")).unwrap();

        let err = registry
            .apply_batch(&[
                PipelineEntry::new_process(info(2, "b")),
                PipelineEntry::update(info(1, "")),
                PipelineEntry::update(info(9, "")),
            ])
            .unwrap_err();

        assert_eq!(err, RegistryError::NotFound(9));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.status(1).unwrap().state, RequestState::Running);
    }

    #[test]
    fn batch_respects_capacity() {
        let (mut registry, _) = registry_at(2, Timeval::default());
        registry.insert(&info(1, "a")).unwrap();

        let err = registry
            .apply_batch(&[
                PipelineEntry::new_process(info(2, "b")),
                PipelineEntry::new_process(info(3, "c")),
            ])
            .unwrap_err();
        assert_eq!(err, RegistryError::Full { capacity: 2 });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn batch_rejects_duplicate_new() {
        let (mut registry, _) = registry_at(4, Timeval::default());
        let err = registry
            .apply_batch(&[
                PipelineEntry::new_process(info(2, "b")),
                PipelineEntry::new_process(info(2, "b")),
            ])
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyTracked(2));
        assert!(registry.is_empty());
    }

    #[test]
    fn expire_finished_keeps_running_and_recent() {
        let (mut registry, clock) = registry_at(8, Timeval::new(0, 0));
        registry.insert(&info(1, "old")).unwrap();
        registry.insert(&info(2, "running")).unwrap();
        registry.insert(&info(3, "recent")).unwrap();
        registry.update(&info(1, "")).unwrap();

        clock.set(Timeval::new(50, 0));
        registry.update(&info(3, "")).unwrap();

        clock.set(Timeval::new(70, 0));
        let removed = registry.expire_finished(Duration::from_secs(30));

        assert_eq!(removed, 1);
        assert_eq!(registry.find(1), None);
        assert_eq!(registry.find(2), Some(0));
        assert_eq!(registry.find(3), Some(1));
        assert!(!registry.is_full());
    }

    #[test]
    fn status_report_serializes() {
        let (mut registry, clock) = registry_at(4, Timeval::new(10, 900_000));
        registry.insert(&info(100, "cargo test")).unwrap();
        clock.set(Timeval::new(11, 100_000));
        registry.update(&info(100, "")).unwrap();

        insta::assert_json_snapshot!(registry.status(100).unwrap(), @r#"
        {
          "pid": 100,
          "command": "cargo test",
          "state": "completed",
          "started_at": {
            "sec": 10,
            "usec": 900000
          },
          "finished_at": {
            "sec": 11,
            "usec": 100000
          },
          "elapsed": {
            "sec": 0,
            "usec": 200000
          }
        }
        "#);
    }
}
