//! 调度补偿服务入口
//!
//! 独立运行补偿扫描：查询到期仍未投递的任务并重新发送信封。
//! 就绪队列的消费端由业务服务进程承载（单队列单消费模型）。

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use notify_shared::broker::MessageBroker;
use notify_shared::config::AppConfig;
use notify_shared::{database, observability};
use notify_task_scheduler::scheduler::BrokerTaskPublisher;
use notify_task_scheduler::store::PgTaskStore;
use notify_task_scheduler::sweeper::Sweeper;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("task-scheduler")?;
    observability::init_tracing(&config.service_name, &config.observability);

    let pool = database::create_pool(&config.database).await?;
    let broker = MessageBroker::connect(config.broker.clone(), "task-scheduler").await;

    let publisher = BrokerTaskPublisher::new(broker.clone());
    publisher.setup_topology().await?;

    let store = Arc::new(PgTaskStore::new(pool));
    let sweeper = Sweeper::new(store, Arc::new(publisher), &config.scheduler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始优雅关闭");

    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;
    broker.close().await;

    info!("调度补偿服务已退出");
    Ok(())
}
