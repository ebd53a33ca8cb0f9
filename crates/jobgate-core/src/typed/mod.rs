//! Typed - 型付き Job API
//!
//! このモジュールは job_type の typo を型で排除し、
//! Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Job` trait, `JobHandler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure
//!
//! Worker は `JobSpec.job_type` で `HandlerRegistry` を引き、`params` を
//! `T` に decode してから handler を呼びます。

pub mod context;
pub mod handler;
pub mod job;
pub mod registry;

pub use self::context::{JobContext, JobError};
pub use self::handler::{DynHandler, JobHandler, TypedHandler};
pub use self::job::Job;
pub use self::registry::{HandlerRegistry, RegistryError};
