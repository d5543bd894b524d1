//! 延迟任务调度服务
//!
//! 调度的权威动作是写库：任务先落库为 PENDING，再尽力投递队列消息。
//! 投递失败只降低时效，不影响正确性——补偿扫描会重新投递到期任务。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use notify_shared::broker::MessageBroker;
use notify_shared::config::SchedulerConfig;
use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::{DeadLetterMessage, TaskMessage, TaskStatus, TaskType, queues};

use crate::store::TaskStore;
use crate::task::{NewTask, ScheduleOptions, Task};

// ---------------------------------------------------------------------------
// TaskPublisher — 投递端抽象
// ---------------------------------------------------------------------------

/// 任务信封的投递端，抽象出来便于调度逻辑脱离代理测试
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    /// 直接投递到就绪队列
    async fn publish_ready(&self, message: &TaskMessage) -> bool;

    /// 经延迟交换机投递，到期后路由到就绪队列
    async fn publish_delayed(&self, message: &TaskMessage, delay: Duration) -> bool;

    /// 投递死信信封，供人工排查
    async fn publish_dead_letter(&self, message: &DeadLetterMessage) -> bool;
}

/// 基于消息代理的投递实现
pub struct BrokerTaskPublisher {
    broker: MessageBroker,
}

impl BrokerTaskPublisher {
    pub fn new(broker: MessageBroker) -> Self {
        Self { broker }
    }

    /// 声明调度所需拓扑：就绪队列、死信队列、延迟交换机及其绑定
    pub async fn setup_topology(&self) -> Result<()> {
        self.broker.assert_queue(queues::TASKS_READY).await?;
        self.broker.assert_queue(queues::DEAD_LETTER).await?;
        self.broker
            .assert_delay_exchange(queues::DELAYED_EXCHANGE)
            .await?;
        self.broker
            .bind_queue(
                queues::TASKS_READY,
                queues::DELAYED_EXCHANGE,
                queues::TASKS_ROUTING_KEY,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskPublisher for BrokerTaskPublisher {
    async fn publish_ready(&self, message: &TaskMessage) -> bool {
        self.broker
            .send_json_to_queue(queues::TASKS_READY, message)
            .await
    }

    async fn publish_delayed(&self, message: &TaskMessage, delay: Duration) -> bool {
        self.broker
            .publish_json_delayed(
                queues::DELAYED_EXCHANGE,
                queues::TASKS_ROUTING_KEY,
                message,
                delay,
            )
            .await
    }

    async fn publish_dead_letter(&self, message: &DeadLetterMessage) -> bool {
        self.broker
            .send_json_to_queue(queues::DEAD_LETTER, message)
            .await
    }
}

// ---------------------------------------------------------------------------
// DelayedTaskScheduler
// ---------------------------------------------------------------------------

/// 延迟任务调度器
pub struct DelayedTaskScheduler {
    store: Arc<dyn TaskStore>,
    publisher: Arc<dyn TaskPublisher>,
    config: SchedulerConfig,
}

impl DelayedTaskScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        publisher: Arc<dyn TaskPublisher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// 调度一个任务
    ///
    /// 落库成功即调度成功，返回任务 ID；消息投递失败仅记录告警。
    pub async fn schedule(
        &self,
        task_type: TaskType,
        payload: Value,
        scheduled_for: DateTime<Utc>,
        opts: ScheduleOptions,
    ) -> Result<Uuid> {
        let id = opts.id.unwrap_or_else(Uuid::now_v7);
        let max_attempts = opts
            .max_attempts
            .unwrap_or(self.config.default_max_attempts) as i32;

        let task = self
            .store
            .insert(NewTask {
                id,
                task_type,
                payload,
                scheduled_for,
                max_attempts,
                created_by: opts.created_by,
            })
            .await?;

        info!(
            task_id = %task.id,
            task_type = %task_type,
            scheduled_for = %scheduled_for,
            "任务已调度"
        );

        self.dispatch(&task).await;
        Ok(id)
    }

    /// 投递任务信封：到期走就绪队列，未到期走延迟交换机
    async fn dispatch(&self, task: &Task) {
        let now = Utc::now();
        let message = task.to_message();

        let delivered = if task.is_due(now) {
            self.publisher.publish_ready(&message).await
        } else {
            let delay = (task.scheduled_for - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            self.publisher.publish_delayed(&message, delay).await
        };

        if !delivered {
            // 补偿扫描会按 scheduled_for 重新投递，只损失时效
            warn!(task_id = %task.id, "任务消息投递未确认，等待补偿扫描");
        }
    }

    /// 取消任务
    ///
    /// 返回 true 表示本次调用完成了取消；false 表示任务已处于终态。
    /// 已入队的消息无法撤回，消费端的状态复查保证取消后的投递只会空转。
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool> {
        let updated = self
            .store
            .transition(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Processing],
                TaskStatus::Cancelled,
            )
            .await?;

        match updated {
            Some(_) => {
                info!(task_id = %task_id, "任务已取消");
                Ok(true)
            }
            None => {
                // 区分"不存在"与"已终态"
                let task = self.get_task(task_id).await?;
                info!(task_id = %task_id, status = %task.status, "任务已处于终态，取消为空操作");
                Ok(false)
            }
        }
    }

    /// 暂停 PENDING 任务，scheduled_for 保持不变
    pub async fn pause(&self, task_id: Uuid) -> Result<Task> {
        let updated = self
            .store
            .transition(task_id, &[TaskStatus::Pending], TaskStatus::Paused)
            .await?;

        match updated {
            Some(task) => {
                info!(task_id = %task_id, "任务已暂停");
                Ok(task)
            }
            None => {
                let task = self.get_task(task_id).await?;
                Err(NotifyError::InvalidTransition {
                    entity: "task".to_string(),
                    from: task.status.to_string(),
                    to: TaskStatus::Paused.to_string(),
                })
            }
        }
    }

    /// 恢复 PAUSED 任务
    ///
    /// 若 scheduled_for 已过期，补偿扫描会在下一轮拾起；
    /// 未过期则重新投递延迟消息。
    pub async fn resume(&self, task_id: Uuid) -> Result<Task> {
        let updated = self
            .store
            .transition(task_id, &[TaskStatus::Paused], TaskStatus::Pending)
            .await?;

        match updated {
            Some(task) => {
                info!(task_id = %task_id, "任务已恢复");
                self.dispatch(&task).await;
                Ok(task)
            }
            None => {
                let task = self.get_task(task_id).await?;
                Err(NotifyError::InvalidTransition {
                    entity: "task".to_string(),
                    from: task.status.to_string(),
                    to: TaskStatus::Pending.to_string(),
                })
            }
        }
    }

    /// 查询任务
    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| NotifyError::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
