//! 活动编排服务入口
//!
//! 承载就绪队列的消费端：活动激活/收尾与延迟批量分发任务
//! 都在这里注册并执行。

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use notify_campaign_service::handlers::{
    BulkDispatchHandler, CampaignActivateHandler, CampaignCompleteHandler,
};
use notify_campaign_service::orchestrator::{
    CampaignOrchestrator, DispatcherCampaignJobs, SchedulerCampaignTasks,
};
use notify_campaign_service::store::PgCampaignStore;
use notify_notification_worker::dispatcher::{BrokerJobPublisher, BulkNotificationDispatcher};
use notify_notification_worker::job::PgBulkJobStore;
use notify_shared::broker::MessageBroker;
use notify_shared::config::AppConfig;
use notify_shared::messages::{TaskType, queues};
use notify_shared::{database, observability};
use notify_task_scheduler::handler::HandlerRegistry;
use notify_task_scheduler::scheduler::{BrokerTaskPublisher, DelayedTaskScheduler};
use notify_task_scheduler::store::PgTaskStore;
use notify_task_scheduler::worker::TaskWorker;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("campaign-service")?;
    observability::init_tracing(&config.service_name, &config.observability);

    let pool = database::create_pool(&config.database).await?;
    let broker = MessageBroker::connect(config.broker.clone(), "campaign-service").await;

    // 任务调度侧
    let task_publisher = Arc::new(BrokerTaskPublisher::new(broker.clone()));
    task_publisher.setup_topology().await?;
    let task_store = Arc::new(PgTaskStore::new(pool.clone()));
    let scheduler = Arc::new(DelayedTaskScheduler::new(
        task_store.clone(),
        task_publisher.clone(),
        config.scheduler.clone(),
    ));

    // 批量作业侧
    let job_publisher = Arc::new(BrokerJobPublisher::new(broker.clone()));
    job_publisher.setup_topology().await?;
    let dispatcher = Arc::new(BulkNotificationDispatcher::new(
        Arc::new(PgBulkJobStore::new(pool.clone())),
        job_publisher,
    ));

    // 活动编排
    let orchestrator = Arc::new(CampaignOrchestrator::new(
        Arc::new(PgCampaignStore::new(pool)),
        Arc::new(DispatcherCampaignJobs::new(dispatcher.clone())),
        Arc::new(SchedulerCampaignTasks::new(scheduler)),
    ));

    let registry = Arc::new(
        HandlerRegistry::new()
            .register(
                TaskType::CampaignActivate,
                Arc::new(CampaignActivateHandler::new(orchestrator.clone())),
            )
            .register(
                TaskType::CampaignComplete,
                Arc::new(CampaignCompleteHandler::new(orchestrator)),
            )
            .register(
                TaskType::BulkDispatch,
                Arc::new(BulkDispatchHandler::new(dispatcher)),
            ),
    );

    let worker = Arc::new(TaskWorker::new(
        task_store,
        registry,
        task_publisher,
        &config.scheduler,
    ));
    broker.consume(queues::TASKS_READY, worker).await?;
    info!("活动编排服务已就绪");

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始优雅关闭");
    broker.close().await;

    info!("活动编排服务已退出");
    Ok(())
}
