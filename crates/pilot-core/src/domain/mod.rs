//! Domain model (ids, tasks, jobs and their states).

pub mod ids;
pub mod job;
pub mod state;
pub mod task;

pub use self::ids::{JobId, TaskId};
pub use self::job::Job;
pub use self::state::{JobState, JobTimes, TaskState};
pub use self::task::{InlineAttachment, Task, TaskError};
