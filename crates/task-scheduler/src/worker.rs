//! 就绪队列消费 worker
//!
//! 每条消息只是"该看看这个任务了"的信号，执行与否以存储中的权威状态
//! 为准：投递时重新核对状态（墓碑检查），已取消/已暂停/已终态的任务
//! 直接确认空转，滞留在 PROCESSING 的任务按中断残留重新认领。失败重试
//! 不走 nack 紧循环，而是退回 PENDING 并经延迟交换机按指数退避重新投递。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use notify_shared::broker::{HandlerOutcome, QueueDelivery, QueueHandler};
use notify_shared::config::SchedulerConfig;
use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::{DeadLetterMessage, TaskMessage, TaskStatus, queues};
use notify_shared::retry::RetryPolicy;

use crate::handler::HandlerRegistry;
use crate::scheduler::TaskPublisher;
use crate::store::TaskStore;
use crate::task::Task;

const SERVICE_NAME: &str = "task-scheduler";

/// 任务执行 worker
pub struct TaskWorker {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    publisher: Arc<dyn TaskPublisher>,
    retry_policy: RetryPolicy,
}

impl TaskWorker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        publisher: Arc<dyn TaskPublisher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            retry_policy: RetryPolicy {
                max_retries: config.default_max_attempts,
                initial_delay: Duration::from_secs(config.retry_initial_seconds),
                max_delay: Duration::from_secs(config.retry_max_seconds),
                multiplier: 2.0,
            },
        }
    }

    /// 无法解析的消息送入死信队列后丢弃
    async fn discard_to_dlq(&self, delivery: &QueueDelivery, reason: &str) -> HandlerOutcome {
        warn!(queue = %delivery.queue, reason, "消息无法处理，转入死信队列");

        let payload = String::from_utf8_lossy(&delivery.payload).into_owned();
        let envelope =
            DeadLetterMessage::new("", queues::TASKS_READY, payload, reason, SERVICE_NAME);
        if !self.publisher.publish_dead_letter(&envelope).await {
            error!("死信投递失败，消息将被直接丢弃");
        }
        HandlerOutcome::Discard
    }

    /// 执行处理器并按结果流转任务状态
    async fn run_task(&self, task: &Task) -> Result<()> {
        let Some(handler) = self.registry.get(task.task_type) else {
            // 类型未注册属于部署错误，任务无法进展，直接判失败
            error!(task_id = %task.id, task_type = %task.task_type, "无已注册的处理器");
            self.store
                .transition(task.id, &[TaskStatus::Processing], TaskStatus::Failed)
                .await?;
            return Ok(());
        };

        match handler.execute(task).await {
            Ok(()) => {
                self.store
                    .transition(task.id, &[TaskStatus::Processing], TaskStatus::Completed)
                    .await?;
                info!(task_id = %task.id, attempts = task.attempts, "任务执行成功");
                Ok(())
            }
            Err(e) => self.handle_failure(task, e).await,
        }
    }

    /// 执行失败：有剩余额度则退避重试，否则终态 FAILED
    async fn handle_failure(&self, task: &Task, cause: NotifyError) -> Result<()> {
        if task.has_attempts_left() {
            let delay = self.retry_policy.delay_for_attempt(
                task.attempts.max(1) as u32 - 1,
            );
            warn!(
                task_id = %task.id,
                attempts = task.attempts,
                max_attempts = task.max_attempts,
                delay_secs = delay.as_secs(),
                error = %cause,
                "任务执行失败，退避后重试"
            );

            let updated = self
                .store
                .transition(task.id, &[TaskStatus::Processing], TaskStatus::Pending)
                .await?;

            if let Some(task) = updated
                && !self
                    .publisher
                    .publish_delayed(&task.to_message(), delay)
                    .await
            {
                // 重试消息丢失由补偿扫描兜底
                warn!(task_id = %task.id, "重试消息投递未确认，等待补偿扫描");
            }
        } else {
            error!(
                task_id = %task.id,
                attempts = task.attempts,
                error = %cause,
                "任务重试额度耗尽，标记失败"
            );
            self.store
                .transition(task.id, &[TaskStatus::Processing], TaskStatus::Failed)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueHandler for TaskWorker {
    async fn handle(&self, delivery: QueueDelivery) -> Result<HandlerOutcome> {
        let message: TaskMessage = match delivery.deserialize_payload() {
            Ok(m) => m,
            Err(e) => return Ok(self.discard_to_dlq(&delivery, &e.to_string()).await),
        };

        let task_id = match Uuid::parse_str(&message.id) {
            Ok(id) => id,
            Err(_) => {
                return Ok(self
                    .discard_to_dlq(&delivery, &format!("非法任务 ID: {}", message.id))
                    .await);
            }
        };

        // 存储不可达属于瞬时故障，Err 由代理层转为重新入队
        let Some(task) = self.store.get(task_id).await? else {
            warn!(task_id = %task_id, "任务记录不存在，丢弃消息");
            return Ok(HandlerOutcome::Discard);
        };

        // 墓碑检查：终态与暂停一律空转；PROCESSING 视为上次执行中断，重新认领
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Processing => {
                info!(task_id = %task_id, "任务滞留在 PROCESSING，重新认领执行");
            }
            _ => {
                info!(task_id = %task_id, status = %task.status, "任务状态已变更，跳过本次投递");
                return Ok(HandlerOutcome::Complete);
            }
        }

        // 受保护转换：并发竞争下守卫落空同样视为空转
        let Some(task) = self.store.begin_attempt(task_id).await? else {
            info!(task_id = %task_id, "任务已进入终态，跳过");
            return Ok(HandlerOutcome::Complete);
        };

        self.run_task(&task).await?;
        Ok(HandlerOutcome::Complete)
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
