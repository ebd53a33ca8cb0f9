//! Ports - 抽象化レイヤー
//!
//! 時刻・ID 生成・成果物の保存先を trait で切り出し、
//! 実装（本番用 / テスト用）を差し替えられるようにします。

pub mod artifact_store;
pub mod clock;
pub mod id_generator;

pub use self::artifact_store::{ArtifactError, ArtifactStore, StoreRequest};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
