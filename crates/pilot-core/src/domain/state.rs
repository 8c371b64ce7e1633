//! State - タスクとジョブの状態
//!
//! Documents only store timestamps; the state is computed from them. The
//! computation rejects combinations no sequence of transitions can produce,
//! so a hand-edited or corrupted document surfaces as `InvalidState` instead
//! of being silently claimed or archived.

use serde::{Deserialize, Serialize};

/// Task lifecycle.
///
/// - Pending -> InProgress (claim) -> Done
/// - InProgress -> Pending (scrub / unlock)
///
/// Errors are orthogonal: see `Task::has_errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Done,
}

impl TaskState {
    pub fn from_timestamps(lock: i64, done: i64) -> Result<Self, String> {
        if lock < 0 || done < 0 {
            return Err(format!("negative timestamp (lock={lock}, done={done})"));
        }
        if done > 0 && lock > done {
            return Err(format!("claimed after completion (lock={lock}, done={done})"));
        }
        Ok(match (lock, done) {
            (_, d) if d > 0 => TaskState::Done,
            (l, _) if l > 0 => TaskState::InProgress,
            _ => TaskState::Pending,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done)
    }

    /// Eligible for a claim.
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskState::Pending)
    }
}

/// Job lifecycle.
///
/// - Pending -> Queued (submission) -> Running (worker start) -> Finished -> Archived
/// - Pending -> Running (worker started without submission bookkeeping)
///
/// `cancel` is a side flag and does not take part in the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Queued,
    Running,
    Finished,
    Archived,
}

/// The five job timestamps, unix seconds, `0` = unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobTimes {
    pub queue: i64,
    pub start: i64,
    pub done: i64,
    pub archive: i64,
    pub cancel: i64,
}

impl JobState {
    pub fn from_times(t: JobTimes) -> Result<Self, String> {
        let all = [t.queue, t.start, t.done, t.archive, t.cancel];
        if all.iter().any(|&v| v < 0) {
            return Err(format!("negative timestamp in {t:?}"));
        }
        if t.archive > 0 && t.done == 0 {
            return Err("archived without being finished".to_string());
        }
        if t.start > 0 && t.done > 0 && t.done < t.start {
            return Err(format!(
                "finished before it started (start={}, done={})",
                t.start, t.done
            ));
        }
        Ok(if t.archive > 0 {
            JobState::Archived
        } else if t.done > 0 {
            JobState::Finished
        } else if t.start > 0 {
            JobState::Running
        } else if t.queue > 0 {
            JobState::Queued
        } else {
            JobState::Pending
        })
    }

    /// Queued or running: counts against the number of jobs a host may run.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::pending(0, 0, TaskState::Pending)]
    #[case::in_progress(100, 0, TaskState::InProgress)]
    #[case::done(100, 200, TaskState::Done)]
    #[case::done_same_second(100, 100, TaskState::Done)]
    #[case::done_without_claim(0, 200, TaskState::Done)]
    fn task_state_from_timestamps(#[case] lock: i64, #[case] done: i64, #[case] expected: TaskState) {
        assert_eq!(TaskState::from_timestamps(lock, done), Ok(expected));
    }

    #[rstest]
    #[case::negative_lock(-1, 0)]
    #[case::negative_done(0, -5)]
    #[case::locked_after_done(300, 200)]
    fn task_state_rejects_impossible_combinations(#[case] lock: i64, #[case] done: i64) {
        assert!(TaskState::from_timestamps(lock, done).is_err());
    }

    fn times(queue: i64, start: i64, done: i64, archive: i64) -> JobTimes {
        JobTimes {
            queue,
            start,
            done,
            archive,
            cancel: 0,
        }
    }

    #[rstest]
    #[case::pending(times(0, 0, 0, 0), JobState::Pending)]
    #[case::queued(times(10, 0, 0, 0), JobState::Queued)]
    #[case::running(times(10, 20, 0, 0), JobState::Running)]
    #[case::running_unsubmitted(times(0, 20, 0, 0), JobState::Running)]
    #[case::finished(times(0, 20, 30, 0), JobState::Finished)]
    #[case::archived(times(10, 20, 30, 40), JobState::Archived)]
    fn job_state_from_times(#[case] t: JobTimes, #[case] expected: JobState) {
        assert_eq!(JobState::from_times(t), Ok(expected));
    }

    #[rstest]
    #[case::archived_unfinished(times(10, 20, 0, 40))]
    #[case::done_before_start(times(10, 50, 30, 0))]
    #[case::negative(times(-1, 0, 0, 0))]
    fn job_state_rejects_impossible_combinations(#[case] t: JobTimes) {
        assert!(JobState::from_times(t).is_err());
    }

    #[test]
    fn cancel_flag_does_not_change_state() {
        let t = JobTimes {
            cancel: 50,
            ..times(10, 20, 0, 0)
        };
        assert_eq!(JobState::from_times(t), Ok(JobState::Running));
        assert!(JobState::Running.is_active());
    }
}
