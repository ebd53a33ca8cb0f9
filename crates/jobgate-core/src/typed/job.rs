//! Job trait - 型付き Job の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Action, JobSpec, NodeId};

/// Job は job_type と params の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct CustomerExport {
///     region: String,
/// }
///
/// impl Job for CustomerExport {
///     const TYPE: &'static str = "crm.customers.export.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: `JobSpec.params` への変換のため
/// - `DeserializeOwned`: worker 側での復元のため（'static に対応）
/// - `Send + Sync`: 複数スレッドから安全に使えるため
/// - `'static`: Arc に格納できるため（参照を持たない）
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// job_type の定義
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    /// - 例: `crm.customers.export.v1`
    const TYPE: &'static str;

    /// Build the request submitted under `action` on `target`.
    fn to_spec(&self, target: NodeId, action: Action) -> Result<JobSpec, serde_json::Error> {
        Ok(JobSpec::new(
            Self::TYPE,
            target,
            action,
            serde_json::to_value(self)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrdersReport {
        month: String,
    }

    impl Job for OrdersReport {
        const TYPE: &'static str = "sales.orders.report.v1";
    }

    #[test]
    fn to_spec_carries_type_and_params() {
        let job = OrdersReport {
            month: "2024-01".into(),
        };
        let spec = job.to_spec(NodeId::new(7), Action::View).unwrap();

        assert_eq!(spec.job_type, "sales.orders.report.v1");
        assert_eq!(spec.target, NodeId::new(7));
        assert_eq!(spec.action, Action::View);
        assert_eq!(spec.params, serde_json::json!({ "month": "2024-01" }));
    }
}
