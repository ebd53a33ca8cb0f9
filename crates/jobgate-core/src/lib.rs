//! jobgate-core
//!
//! Permission-gated asynchronous jobs: a caller submits a job against a menu
//! node, the role binding on that exact node decides, a worker pool runs it,
//! and the artifact is downloadable until it expires.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, action, role, job, state, artifact, errors）
//! - **tree**: arena ベースの木（メニュー、組織図）
//! - **auth**: ロール、(role, node) → action の binding、AuthGate
//! - **registry**: task の状態表（claim / heartbeat / reaper）
//! - **queue**: 容量付きの task id キュー
//! - **typed**: 型付き Job API（Job trait, JobHandler trait, HandlerRegistry）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, ArtifactStore）
//! - **impls**: 実装（InMemoryArtifactStore）
//! - **app**: アプリケーションロジック（builder, runtime, scheduler, worker_loop, reaper, gc）
//! - **config**: 実行時設定

pub mod app;
pub mod auth;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod registry;
pub mod tree;
pub mod typed;

pub use self::app::{AppBuilder, Runtime};
pub use self::config::RuntimeConfig;
