//! 调度任务处理器
//!
//! 活动到点激活/收尾由延迟任务驱动，处理器只做"解析负载 → 调编排器"。
//! 至少一次投递下同一任务可能重复执行：状态流转被拒说明目标状态
//! 已经达成（或活动已被人工终止），按成功处理。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use notify_notification_worker::dispatcher::{BulkNotificationDispatcher, EnqueueOptions};
use notify_notification_worker::recipients::RecipientFilter;
use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::Channel;
use notify_task_scheduler::handler::TaskHandler;
use notify_task_scheduler::task::Task;

use crate::orchestrator::CampaignOrchestrator;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CampaignTaskPayload {
    campaign_id: Uuid,
}

fn parse_campaign_payload(task: &Task) -> Result<Uuid> {
    let payload: CampaignTaskPayload =
        serde_json::from_value(task.payload.clone()).map_err(|e| NotifyError::TaskExecution {
            task_id: task.id.to_string(),
            reason: format!("活动任务负载非法: {e}"),
        })?;
    Ok(payload.campaign_id)
}

/// 幂等容错：状态流转被拒视为目标已达成
fn tolerate_transition(result: Result<()>, task_id: Uuid) -> Result<()> {
    match result {
        Err(NotifyError::InvalidTransition { from, to, .. }) => {
            info!(task_id = %task_id, from, to, "活动状态已流转过，任务按成功处理");
            Ok(())
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// CampaignActivateHandler
// ---------------------------------------------------------------------------

/// 到点激活活动
pub struct CampaignActivateHandler {
    orchestrator: Arc<CampaignOrchestrator>,
}

impl CampaignActivateHandler {
    pub fn new(orchestrator: Arc<CampaignOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for CampaignActivateHandler {
    async fn execute(&self, task: &Task) -> Result<()> {
        let campaign_id = parse_campaign_payload(task)?;
        info!(task_id = %task.id, campaign_id = %campaign_id, "执行活动激活任务");

        let result = self.orchestrator.activate(campaign_id).await.map(|_| ());
        tolerate_transition(result, task.id)
    }
}

// ---------------------------------------------------------------------------
// CampaignCompleteHandler
// ---------------------------------------------------------------------------

/// 到点收尾活动
pub struct CampaignCompleteHandler {
    orchestrator: Arc<CampaignOrchestrator>,
}

impl CampaignCompleteHandler {
    pub fn new(orchestrator: Arc<CampaignOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for CampaignCompleteHandler {
    async fn execute(&self, task: &Task) -> Result<()> {
        let campaign_id = parse_campaign_payload(task)?;
        info!(task_id = %task.id, campaign_id = %campaign_id, "执行活动收尾任务");

        let result = self.orchestrator.complete(campaign_id).await.map(|_| ());
        tolerate_transition(result, task.id)
    }
}

// ---------------------------------------------------------------------------
// BulkDispatchHandler
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkDispatchPayload {
    channel: Channel,
    #[serde(default)]
    subject: Option<String>,
    content: String,
    #[serde(default)]
    filter: RecipientFilter,
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(default)]
    created_by: Option<String>,
}

/// 延迟批量分发：到点把负载转为一个批量作业
pub struct BulkDispatchHandler {
    dispatcher: Arc<BulkNotificationDispatcher>,
}

impl BulkDispatchHandler {
    pub fn new(dispatcher: Arc<BulkNotificationDispatcher>) -> Self {
        Self { dispatcher }
    }

    fn parse_payload(task: &Task) -> Result<BulkDispatchPayload> {
        serde_json::from_value(task.payload.clone()).map_err(|e| NotifyError::TaskExecution {
            task_id: task.id.to_string(),
            reason: format!("批量分发负载非法: {e}"),
        })
    }
}

#[async_trait]
impl TaskHandler for BulkDispatchHandler {
    async fn execute(&self, task: &Task) -> Result<()> {
        let payload = Self::parse_payload(task)?;

        let job_id = self
            .dispatcher
            .enqueue(
                payload.channel,
                payload.content,
                payload.filter,
                EnqueueOptions {
                    subject: payload.subject,
                    variables: payload.variables,
                    campaign_id: None,
                    created_by: payload.created_by,
                },
            )
            .await?;

        info!(task_id = %task.id, job_id = %job_id, "延迟批量分发任务已转为作业");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use notify_shared::messages::{TaskStatus, TaskType};

    fn task_with_payload(payload: serde_json::Value) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            task_type: TaskType::CampaignActivate,
            payload,
            scheduled_for: now,
            status: TaskStatus::Processing,
            attempts: 1,
            max_attempts: 3,
            last_attempt_at: Some(now),
            completed_at: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_parse_campaign_payload() {
        let id = Uuid::now_v7();
        let task = task_with_payload(serde_json::json!({ "campaignId": id }));
        assert_eq!(parse_campaign_payload(&task).unwrap(), id);
    }

    #[test]
    fn test_parse_campaign_payload_rejects_garbage() {
        let task = task_with_payload(serde_json::json!({ "something": "else" }));
        let err = parse_campaign_payload(&task).unwrap_err();
        assert!(matches!(err, NotifyError::TaskExecution { .. }));
    }

    #[test]
    fn test_tolerate_transition_absorbs_invalid_transition() {
        let result = tolerate_transition(
            Err(NotifyError::InvalidTransition {
                entity: "campaign".to_string(),
                from: "ACTIVE".to_string(),
                to: "ACTIVE".to_string(),
            }),
            Uuid::now_v7(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_tolerate_transition_propagates_other_errors() {
        let result = tolerate_transition(
            Err(NotifyError::Internal("别的问题".to_string())),
            Uuid::now_v7(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bulk_dispatch_payload_defaults() {
        let task = task_with_payload(serde_json::json!({
            "channel": "EMAIL",
            "content": "内容",
        }));
        let payload = BulkDispatchHandler::parse_payload(&task).unwrap();
        assert_eq!(payload.channel, Channel::Email);
        assert!(payload.subject.is_none());
        assert!(payload.filter.is_empty());
    }
}
