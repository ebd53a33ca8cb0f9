//! App - アプリケーション層
//!
//! ports と各コンポーネントを組み合わせて、API 層に見せる面を作ります。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 構築とワイヤリング（起動時検証）
//! - **Runtime**: submit / get_status / cancel / fetch と管理操作
//! - **TaskScheduler**: 権限チェック → 行作成 → enqueue
//! - **WorkerPool**: pop → claim → handle → store → complete
//! - **ReaperLoop**: heartbeat の途絶えた task の回収
//! - **GcLoop**: 期限切れ artifact の掃除

pub mod background;
pub mod builder;
pub mod gc_loop;
pub mod reaper_loop;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::background::{BackgroundTasks, LoopHandle};
pub use self::builder::{AppBuilder, BuildError};
pub use self::gc_loop::GcLoop;
pub use self::reaper_loop::ReaperLoop;
pub use self::retry::RetryPolicy;
pub use self::runtime::{AdminError, FetchError, Runtime};
pub use self::scheduler::{SchedulerError, TaskScheduler};
pub use self::status::TaskStatusView;
pub use self::worker_loop::{WorkerDeps, WorkerPool};
