//! 批量通知分发
//!
//! 入队侧（BulkNotificationDispatcher）负责作业落库与信封投递；
//! 执行侧（DispatchWorker）消费作业队列，解析收件人后分块串行发送。
//! 块间有固定间隔为下游留出喘息，取消在每个块边界复查——已发出的
//! 块无法召回，取消只保证"不再发新的"。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use notify_shared::broker::{HandlerOutcome, MessageBroker, QueueDelivery, QueueHandler};
use notify_shared::config::DispatcherConfig;
use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::{Channel, DeadLetterMessage, JobMessage, JobStatus, queues};

use crate::job::{BulkJob, BulkJobStore, NewBulkJob};
use crate::recipients::{Recipient, RecipientFilter, RecipientRepository};
use crate::sender::{NotificationChannelSender, Priority, SendRequest};
use crate::template;

const SERVICE_NAME: &str = "notification-worker";

// ---------------------------------------------------------------------------
// JobPublisher — 投递端抽象
// ---------------------------------------------------------------------------

/// 作业信封投递端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish_job(&self, message: &JobMessage) -> bool;

    async fn publish_dead_letter(&self, message: &DeadLetterMessage) -> bool;
}

/// 基于消息代理的实现
pub struct BrokerJobPublisher {
    broker: MessageBroker,
}

impl BrokerJobPublisher {
    pub fn new(broker: MessageBroker) -> Self {
        Self { broker }
    }

    /// 声明作业队列与死信队列
    pub async fn setup_topology(&self) -> Result<()> {
        self.broker.assert_queue(queues::JOBS).await?;
        self.broker.assert_queue(queues::DEAD_LETTER).await?;
        Ok(())
    }
}

#[async_trait]
impl JobPublisher for BrokerJobPublisher {
    async fn publish_job(&self, message: &JobMessage) -> bool {
        self.broker.send_json_to_queue(queues::JOBS, message).await
    }

    async fn publish_dead_letter(&self, message: &DeadLetterMessage) -> bool {
        self.broker
            .send_json_to_queue(queues::DEAD_LETTER, message)
            .await
    }
}

// ---------------------------------------------------------------------------
// BulkNotificationDispatcher — 入队侧
// ---------------------------------------------------------------------------

/// 入队选项
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub subject: Option<String>,
    /// 调用方模板变量，渲染时覆盖系统默认变量
    pub variables: HashMap<String, String>,
    pub campaign_id: Option<Uuid>,
    pub created_by: Option<String>,
}

/// 批量分发服务
pub struct BulkNotificationDispatcher {
    store: Arc<dyn BulkJobStore>,
    publisher: Arc<dyn JobPublisher>,
}

impl BulkNotificationDispatcher {
    pub fn new(store: Arc<dyn BulkJobStore>, publisher: Arc<dyn JobPublisher>) -> Self {
        Self { store, publisher }
    }

    /// 创建一个批量作业并投递执行信号
    ///
    /// 落库即创建成功；信封投递失败仅告警，作业停留在 PENDING，
    /// 可由运维重新投递。
    pub async fn enqueue(
        &self,
        channel: Channel,
        content: impl Into<String>,
        filter: RecipientFilter,
        opts: EnqueueOptions,
    ) -> Result<Uuid> {
        let job = self
            .store
            .insert(NewBulkJob {
                id: Uuid::now_v7(),
                channel,
                subject: opts.subject,
                content: content.into(),
                variables: opts.variables,
                filter,
                campaign_id: opts.campaign_id,
                created_by: opts.created_by.unwrap_or_else(|| "system".to_string()),
            })
            .await?;

        info!(
            job_id = %job.id,
            channel = %channel,
            campaign_id = ?job.campaign_id,
            "批量作业已创建"
        );

        if !self.publisher.publish_job(&job.to_message()).await {
            warn!(job_id = %job.id, "作业信封投递未确认，作业停留在 PENDING");
        }
        Ok(job.id)
    }

    pub async fn enqueue_bulk_email(
        &self,
        subject: impl Into<String>,
        content: impl Into<String>,
        filter: RecipientFilter,
        mut opts: EnqueueOptions,
    ) -> Result<Uuid> {
        opts.subject = Some(subject.into());
        self.enqueue(Channel::Email, content, filter, opts).await
    }

    pub async fn enqueue_bulk_sms(
        &self,
        content: impl Into<String>,
        filter: RecipientFilter,
        opts: EnqueueOptions,
    ) -> Result<Uuid> {
        self.enqueue(Channel::Sms, content, filter, opts).await
    }

    pub async fn enqueue_bulk_push(
        &self,
        subject: impl Into<String>,
        content: impl Into<String>,
        filter: RecipientFilter,
        mut opts: EnqueueOptions,
    ) -> Result<Uuid> {
        opts.subject = Some(subject.into());
        self.enqueue(Channel::Push, content, filter, opts).await
    }

    /// 查询作业状态与计数
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<BulkJob> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| NotifyError::NotFound {
                entity: "bulk_job".to_string(),
                id: job_id.to_string(),
            })
    }

    /// 取消作业
    ///
    /// 返回 true 表示本次调用完成了取消。PROCESSING 中的作业由
    /// worker 在块边界感知取消，已发出的块无法召回。
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let updated = self
            .store
            .transition(
                job_id,
                &[JobStatus::Pending, JobStatus::Processing],
                JobStatus::Cancelled,
            )
            .await?;

        match updated {
            Some(_) => {
                info!(job_id = %job_id, "批量作业已取消");
                Ok(true)
            }
            None => {
                let job = self.get_job_status(job_id).await?;
                info!(job_id = %job_id, status = %job.status, "作业已处于终态，取消为空操作");
                Ok(false)
            }
        }
    }

    pub async fn list_active_jobs(&self) -> Result<Vec<BulkJob>> {
        self.store.list_active().await
    }

    /// 某活动名下的全部作业
    pub async fn jobs_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<BulkJob>> {
        self.store.list_by_campaign(campaign_id).await
    }
}

// ---------------------------------------------------------------------------
// DispatchWorker — 执行侧
// ---------------------------------------------------------------------------

/// 作业队列消费 worker
pub struct DispatchWorker {
    store: Arc<dyn BulkJobStore>,
    recipients: Arc<dyn RecipientRepository>,
    sender: Arc<NotificationChannelSender>,
    publisher: Arc<dyn JobPublisher>,
    batch_size: usize,
    batch_interval: Duration,
}

impl DispatchWorker {
    pub fn new(
        store: Arc<dyn BulkJobStore>,
        recipients: Arc<dyn RecipientRepository>,
        sender: Arc<NotificationChannelSender>,
        publisher: Arc<dyn JobPublisher>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            store,
            recipients,
            sender,
            publisher,
            batch_size: config.batch_size.max(1),
            batch_interval: Duration::from_millis(config.batch_interval_ms),
        }
    }

    /// 启动时补投未终态作业的执行信号
    ///
    /// 信封丢失（入队时投递失败、代理重启）或 worker 崩溃都可能让
    /// 作业停在 PENDING / PROCESSING 而队列里没有对应消息。重复信号
    /// 无害，消费侧的认领守卫保证不会并发执行。
    pub async fn recover_stranded(&self) -> Result<usize> {
        let jobs = self.store.list_active().await?;
        let mut published = 0usize;
        for job in &jobs {
            if self.publisher.publish_job(&job.to_message()).await {
                published += 1;
            } else {
                warn!(job_id = %job.id, "补投未确认，待下次启动重试");
            }
        }
        if published > 0 {
            info!(count = published, "已补投滞留作业的执行信号");
        }
        Ok(published)
    }

    async fn discard_to_dlq(&self, delivery: &QueueDelivery, reason: &str) -> HandlerOutcome {
        warn!(queue = %delivery.queue, reason, "作业消息无法处理，转入死信队列");

        let payload = String::from_utf8_lossy(&delivery.payload).into_owned();
        let envelope = DeadLetterMessage::new("", queues::JOBS, payload, reason, SERVICE_NAME);
        if !self.publisher.publish_dead_letter(&envelope).await {
            error!("死信投递失败，消息将被直接丢弃");
        }
        HandlerOutcome::Discard
    }

    /// 发送一个分块，返回（成功数, 失败数）
    ///
    /// 块内收件人互不影响：单人失败只累加失败计数，不终止作业。
    async fn send_chunk(&self, job: &BulkJob, chunk: &[Recipient]) -> (i32, i32) {
        let vars = &job.variables.0;
        let mut sent = 0;
        let mut failed = 0;

        for recipient in chunk {
            let content = template::render(&job.content, recipient, vars);
            let subject = job
                .subject
                .as_deref()
                .map(|s| template::render(s, recipient, vars));

            let request = SendRequest {
                recipient: recipient.clone(),
                channel: job.channel,
                subject,
                content,
                attachments: vec![],
                priority: Priority::Normal,
                metadata: serde_json::json!({ "jobId": job.id }),
            };

            match self.sender.send(request).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        user_id = %recipient.id,
                        error = %e,
                        "单收件人发送失败"
                    );
                    failed += 1;
                }
            }
        }
        (sent, failed)
    }

    /// 执行作业主体。返回 Err 仅当基础设施不可用（重新入队重试）。
    async fn run_job(&self, job: BulkJob) -> Result<()> {
        let recipients = match self.recipients.resolve(&job.filter.0).await {
            Ok(r) => r,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "收件人解析失败，作业标记失败");
                self.store
                    .transition(job.id, &[JobStatus::Processing], JobStatus::Failed)
                    .await?;
                return Ok(());
            }
        };

        info!(
            job_id = %job.id,
            recipients = recipients.len(),
            batch_size = self.batch_size,
            "开始分块分发"
        );

        for (index, chunk) in recipients.chunks(self.batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch_interval).await;

                // 块边界复查取消：已发出的块无法召回
                let Some(current) = self.store.get(job.id).await? else {
                    warn!(job_id = %job.id, "作业记录消失，中止分发");
                    return Ok(());
                };
                if current.status != JobStatus::Processing {
                    info!(
                        job_id = %job.id,
                        status = %current.status,
                        "作业状态已变更，停止后续分块"
                    );
                    return Ok(());
                }
            }

            let (sent, failed) = self.send_chunk(&job, chunk).await;
            self.store.add_counters(job.id, sent, failed).await?;
        }

        let completed = self
            .store
            .transition(job.id, &[JobStatus::Processing], JobStatus::Completed)
            .await?;
        if completed.is_some() {
            info!(job_id = %job.id, "批量作业完成");
        }
        Ok(())
    }
}

#[async_trait]
impl QueueHandler for DispatchWorker {
    async fn handle(&self, delivery: QueueDelivery) -> Result<HandlerOutcome> {
        let message: JobMessage = match delivery.deserialize_payload() {
            Ok(m) => m,
            Err(e) => return Ok(self.discard_to_dlq(&delivery, &e.to_string()).await),
        };

        let job_id = match Uuid::parse_str(&message.id) {
            Ok(id) => id,
            Err(_) => {
                return Ok(self
                    .discard_to_dlq(&delivery, &format!("非法作业 ID: {}", message.id))
                    .await);
            }
        };

        let Some(job) = self.store.get(job_id).await? else {
            warn!(job_id = %job_id, "作业记录不存在，丢弃消息");
            return Ok(HandlerOutcome::Discard);
        };

        // 墓碑检查：终态作业跳过；PROCESSING 视为中断残留，重新认领
        match job.status {
            JobStatus::Pending => {}
            JobStatus::Processing => {
                info!(job_id = %job_id, "作业滞留在 PROCESSING，重新认领执行");
            }
            _ => {
                info!(job_id = %job_id, status = %job.status, "作业状态已变更，跳过本次投递");
                return Ok(HandlerOutcome::Complete);
            }
        }

        let Some(job) = self.store.begin_processing(job_id).await? else {
            info!(job_id = %job_id, "作业已进入终态，跳过");
            return Ok(HandlerOutcome::Complete);
        };

        self.run_job(job).await?;
        Ok(HandlerOutcome::Complete)
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
