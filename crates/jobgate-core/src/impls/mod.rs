//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryArtifactStore**: プロセス内の成果物ストア（開発・テスト用）
//!
//! Blob ストレージ向けの実装は `ArtifactStore` を実装した別クレートに置く想定です。

pub mod inmem_artifacts;

pub use self::inmem_artifacts::InMemoryArtifactStore;
