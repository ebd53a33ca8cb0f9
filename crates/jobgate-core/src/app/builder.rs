//! AppBuilder - Runtime の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::runtime::Runtime;
use crate::config::{ConfigError, RuntimeConfig};
use crate::impls::InMemoryArtifactStore;
use crate::ports::{ArtifactStore, Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::typed::{HandlerRegistry, Job, JobHandler, RegistryError};

/// AppBuilder は Runtime を構築
///
/// # 使用例
/// ```ignore
/// let runtime = AppBuilder::new()
///     .with_config(config)
///     .register::<CustomerExport, _>(CustomerExportHandler)?
///     .expect_jobs(&[CustomerExport::TYPE])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_jobs() で期待される job_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
/// - 不足があれば BuildError を返す
pub struct AppBuilder {
    config: RuntimeConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    handlers: HandlerRegistry,
    expected_jobs: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing job types: {0:?}. These jobs were expected but not registered.")]
    MissingJobTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            clock: None,
            ids: None,
            artifacts: None,
            handlers: HandlerRegistry::new(),
            expected_jobs: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a [`UlidGenerator`] over the configured clock.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to [`InMemoryArtifactStore`].
    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Handler を登録
    pub fn register<T: Job, H: JobHandler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.handlers.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される job_type のリストを設定
    pub fn expect_jobs(mut self, job_types: &[&str]) -> Self {
        self.expected_jobs = Some(job_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// # 検証
    /// - 設定値（`RuntimeConfig::validate`）
    /// - expect_jobs() で設定された job_type が全て登録されているか
    pub fn build(self) -> Result<Runtime, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_jobs {
            let missing: Vec<String> = expected
                .iter()
                .filter(|job_type| !self.handlers.contains(job_type))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingJobTypes(missing));
            }
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(InMemoryArtifactStore::new()));

        Ok(Runtime::assemble(
            self.config,
            clock,
            ids,
            artifacts,
            self.handlers,
        ))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
