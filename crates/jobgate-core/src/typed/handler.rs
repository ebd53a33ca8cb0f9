//! Handler trait - Job を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (JobHandler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::context::{JobContext, JobError};
use super::job::Job;
use crate::domain::ArtifactOutput;
use crate::domain::errors::codes;

/// JobHandler は Job を実行して artifact を返す
///
/// # 使用例
/// ```ignore
/// struct CustomerExportHandler;
///
/// #[async_trait]
/// impl JobHandler<CustomerExport> for CustomerExportHandler {
///     async fn run(&self, job: CustomerExport, ctx: JobContext) -> Result<ArtifactOutput, JobError> {
///         ctx.report_progress(50)?;
///         ctx.checkpoint()?;
///         Ok(ArtifactOutput::new(csv, "text/csv", "customers.csv"))
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `JobHandler<CustomerExport>` は `CustomerExport` しか受け取れない
/// - コンパイル時に Job と Handler の対応が保証される
#[async_trait]
pub trait JobHandler<T: Job>: Send + Sync {
    async fn run(&self, job: T, ctx: JobContext) -> Result<ArtifactOutput, JobError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<T> を DynHandler に変換することで、
/// HashMap<String, Arc<dyn DynHandler>> に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn run_dyn(
        &self,
        params: serde_json::Value,
        ctx: JobContext,
    ) -> Result<ArtifactOutput, JobError>;

    fn job_type(&self) -> &'static str;
}

pub struct TypedHandler<T: Job, H: JobHandler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Job, H: JobHandler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Job, H: JobHandler<T>> DynHandler for TypedHandler<T, H> {
    async fn run_dyn(
        &self,
        params: serde_json::Value,
        ctx: JobContext,
    ) -> Result<ArtifactOutput, JobError> {
        let job: T = serde_json::from_value(params).map_err(|e| {
            JobError::failed(codes::INVALID_PARAMS, format!("{}: {e}", T::TYPE))
        })?;
        self.handler.run(job, ctx).await
    }

    fn job_type(&self) -> &'static str {
        T::TYPE
    }
}
