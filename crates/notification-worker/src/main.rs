//! 通知分发服务入口
//!
//! 消费作业队列，承载批量分发执行侧与各通道的发送流水线。

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use notify_notification_worker::channels::{
    EmailChannel, PushChannel, SimulatedEmailTransport, SimulatedPushTransport,
    SimulatedSmsTransport, SmsChannel,
};
use notify_notification_worker::channels::push::PgDeviceTokenRepository;
use notify_notification_worker::dispatcher::{BrokerJobPublisher, DispatchWorker};
use notify_notification_worker::job::PgBulkJobStore;
use notify_notification_worker::recipients::PgRecipientRepository;
use notify_notification_worker::sender::{NotificationChannelSender, PgNotificationRecordStore};
use notify_shared::broker::MessageBroker;
use notify_shared::config::AppConfig;
use notify_shared::messages::queues;
use notify_shared::{database, observability};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("notification-worker")?;
    observability::init_tracing(&config.service_name, &config.observability);

    let pool = database::create_pool(&config.database).await?;
    let broker = MessageBroker::connect(config.broker.clone(), "notification-worker").await;

    let publisher = Arc::new(BrokerJobPublisher::new(broker.clone()));
    publisher.setup_topology().await?;

    let record_store = Arc::new(PgNotificationRecordStore::new(pool.clone()));
    let device_tokens = Arc::new(PgDeviceTokenRepository::new(pool.clone()));

    let sender = Arc::new(
        NotificationChannelSender::new(record_store, config.channels.clone())
            .with_channel(Arc::new(EmailChannel::new(
                Arc::new(SimulatedEmailTransport),
                &config.channels,
            )))
            .with_channel(Arc::new(SmsChannel::new(
                Arc::new(SimulatedSmsTransport),
                &config.channels,
            )))
            .with_channel(Arc::new(PushChannel::new(
                Arc::new(SimulatedPushTransport),
                device_tokens,
            ))),
    );

    let worker = Arc::new(DispatchWorker::new(
        Arc::new(PgBulkJobStore::new(pool.clone())),
        Arc::new(PgRecipientRepository::new(pool)),
        sender,
        publisher,
        &config.dispatcher,
    ));

    // 启动时补投滞留作业的执行信号，消费侧按状态守卫去重
    worker.recover_stranded().await?;

    broker.consume(queues::JOBS, worker).await?;
    info!("通知分发服务已就绪");

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始优雅关闭");
    broker.close().await;

    info!("通知分发服务已退出");
    Ok(())
}
