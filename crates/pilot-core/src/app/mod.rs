//! App - アプリケーション層
//!
//! ports を組み合わせてタスクとジョブのライフサイクルを実装します。
//!
//! # 主要コンポーネント
//! - **Context**: ストア、時計、リトライ方針、現在のジョブ ID
//! - **TaskRepository / JobRepository**: 永続化と状態遷移
//! - **TaskIterator**: claim しながらのタスク列挙
//! - **JobActor**: ジョブ一つ分の実行ループ
//! - **ExecuteWorker**: 外部コマンドを実行する `TaskProcessor`
//! - **Scrubber**: 停止したワーカーの後片付けと整合性チェック

pub mod context;
pub mod execute;
pub mod iterator;
pub mod jobs;
pub mod retry;
pub mod scrubber;
pub mod tasks;
pub mod worker_loop;

pub use self::context::{Context, ContextBuilder, JOB_ID_ENV};
pub use self::execute::ExecuteWorker;
pub use self::iterator::{
    EndlessIterator, JobCancelled, Never, PrioritizedIterator, StopCondition, TaskIterator,
    ViewIterator, task_iterator,
};
pub use self::jobs::JobRepository;
pub use self::retry::RetryPolicy;
pub use self::scrubber::{CheckReport, ScrubReport, Scrubber};
pub use self::tasks::TaskRepository;
pub use self::worker_loop::{JobActor, RunBudget, RunReport, StopReason, TaskProcessor};
