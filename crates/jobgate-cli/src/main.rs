use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use jobgate_core::app::RetryPolicy;
use jobgate_core::domain::{Action, ActionSet, Actor, ArtifactOutput};
use jobgate_core::tree::{MenuEntry, MenuKind, NewNode, Position};
use jobgate_core::typed::{Job, JobContext, JobError, JobHandler};
use jobgate_core::{AppBuilder, RuntimeConfig};

/// 顧客一覧の CSV export
#[derive(Debug, Serialize, Deserialize)]
struct CustomerExport {
    region: String,
    rows: usize,
}

impl Job for CustomerExport {
    const TYPE: &'static str = "crm.customers.export.v1";
}

struct CustomerExportHandler;

#[async_trait]
impl JobHandler<CustomerExport> for CustomerExportHandler {
    async fn run(&self, job: CustomerExport, ctx: JobContext) -> Result<ArtifactOutput, JobError> {
        let mut csv = String::from("id,name,region\n");
        let chunk = (job.rows / 4).max(1);
        for n in 0..job.rows {
            csv.push_str(&format!("{n},customer-{n},{}\n", job.region));
            if (n + 1) % chunk == 0 {
                // 途中経過を書き、取消要求があればここで止まる
                let progress = ((n + 1) * 100 / job.rows).min(99) as u8;
                ctx.report_progress(progress)?;
                ctx.checkpoint()?;
                sleep(Duration::from_millis(100)).await;
            }
        }
        ctx.report_progress(100)?;
        Ok(ArtifactOutput::new(
            csv,
            "text/csv",
            format!("customers-{}.csv", job.region),
        ))
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config() -> Result<RuntimeConfig, Box<dyn Error>> {
    match std::env::var("JOBGATE_CONFIG") {
        Ok(path) => {
            info!(%path, "loading config");
            Ok(RuntimeConfig::from_json_file(path)?)
        }
        Err(_) => Ok(RuntimeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    // (A) Runtime を組み立てる（期待する job_type が無ければ起動しない）
    let runtime = AppBuilder::new()
        .with_config(load_config()?)
        .register::<CustomerExport, _>(CustomerExportHandler)?
        .expect_jobs(&[CustomerExport::TYPE])
        .build()?;

    // (B) メニュー・組織図・ロール・binding を用意
    let menu = runtime.menu();
    let crm = menu.insert(None, NewNode::new("CRM", 10, MenuEntry::new("/crm", MenuKind::Directory)))?;
    let customers = menu.insert(
        Some(crm),
        NewNode::new("Customers", 10, MenuEntry::new("/crm/customers", MenuKind::Page)),
    )?;
    menu.insert(
        Some(customers),
        NewNode::new("Export", 10, MenuEntry::new("/crm/customers:export", MenuKind::Button)),
    )?;

    let head = runtime
        .positions()
        .insert(None, NewNode::new("Head of sales", 0, Position::new("HOS")))?;
    runtime
        .positions()
        .insert(Some(head), NewNode::new("Account manager", 0, Position::new("AM")))?;

    let sales_admin = runtime.roles().create("Sales admin", "sales_admin")?;
    let intern = runtime.roles().create("Intern", "intern")?;
    runtime.grant(sales_admin, crm, ActionSet::from(Action::View))?;
    runtime.grant(sales_admin, customers, ActionSet::of(&[Action::View, Action::Create]))?;
    // 親にだけ binding。子には継承されない
    runtime.grant(intern, crm, ActionSet::all())?;

    let alice = Actor::new("alice", sales_admin);
    let ivan = Actor::new("ivan", intern);
    for entry in runtime.visible_menu(&alice) {
        info!(actor = %alice.id, route = %entry.data.route, "menu entry visible");
    }

    // (C) worker / reaper / sweep を起動
    let background = runtime.start();
    info!(workers = background.worker_count(), "runtime started");

    let job = CustomerExport {
        region: "emea".into(),
        rows: 40,
    };

    // (D) 権限のない submit は行を作らずに失敗する
    if let Err(err) = runtime.submit(&ivan, job.to_spec(customers, Action::View)?) {
        warn!(actor = %ivan.id, error = %err, "submit rejected");
    }

    // (E) 投入してポーリング
    let task_id = runtime
        .submit_with_retry(&alice, job.to_spec(customers, Action::View)?, &RetryPolicy::default())
        .await?;
    loop {
        let view = runtime.get_status(task_id)?;
        info!(status = %serde_json::to_string(&view)?, "poll");
        if view.status.is_terminal() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    // (F) ダウンロード
    match runtime.fetch(&alice, task_id).await {
        Ok(artifact) => info!(
            filename = %artifact.artifact_ref.meta.filename,
            size = artifact.artifact_ref.meta.size,
            expires_at = %artifact.artifact_ref.expires_at,
            "artifact downloaded"
        ),
        Err(err) => warn!(error = %err, "download failed"),
    }
    info!(counts = ?runtime.counts(), "done");

    // (G) 新しい仕事を取るのをやめ、全ループの終了を待つ
    background.shutdown().await;
    Ok(())
}
