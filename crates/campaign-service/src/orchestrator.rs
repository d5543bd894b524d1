//! 活动编排
//!
//! 活动状态流转与两侧依赖（任务调度、批量作业）之间的粘合层。
//! 调度与作业入口都抽象为 trait，编排逻辑可脱离基础设施测试。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use notify_notification_worker::dispatcher::{BulkNotificationDispatcher, EnqueueOptions};
use notify_shared::error::{NotifyError, Result};
use notify_shared::messages::{Channel, TaskType};
use notify_task_scheduler::scheduler::DelayedTaskScheduler;
use notify_task_scheduler::task::ScheduleOptions;

use crate::campaign::{Campaign, CampaignStats, CampaignStatus, NewCampaign};
use crate::store::CampaignStore;

// ---------------------------------------------------------------------------
// 依赖抽象
// ---------------------------------------------------------------------------

/// 活动相关的延迟任务入口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CampaignTasks: Send + Sync {
    /// 为活动安排到点激活任务
    async fn schedule_activation(&self, campaign_id: Uuid, at: DateTime<Utc>) -> Result<Uuid>;

    /// 为活动安排到点收尾任务
    async fn schedule_completion(&self, campaign_id: Uuid, at: DateTime<Utc>) -> Result<Uuid>;
}

/// 作业聚合计数
#[derive(Debug, Clone, Copy, Default)]
pub struct JobTotals {
    pub job_count: usize,
    pub total_sent: i64,
    pub total_failed: i64,
}

/// 活动名下批量作业的入口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CampaignJobs: Send + Sync {
    /// 为活动在指定通道创建一个批量作业
    async fn enqueue(&self, campaign: &Campaign, channel: Channel) -> Result<Uuid>;

    /// 尽力取消活动名下全部未终态作业，返回取消数
    async fn cancel_all(&self, campaign_id: Uuid) -> Result<usize>;

    /// 聚合活动名下作业计数
    async fn totals(&self, campaign_id: Uuid) -> Result<JobTotals>;
}

/// 基于调度器的任务入口实现
pub struct SchedulerCampaignTasks {
    scheduler: Arc<DelayedTaskScheduler>,
}

impl SchedulerCampaignTasks {
    pub fn new(scheduler: Arc<DelayedTaskScheduler>) -> Self {
        Self { scheduler }
    }

    async fn schedule(
        &self,
        task_type: TaskType,
        campaign_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.scheduler
            .schedule(
                task_type,
                serde_json::json!({ "campaignId": campaign_id }),
                at,
                ScheduleOptions {
                    created_by: Some("campaign-service".to_string()),
                    ..Default::default()
                },
            )
            .await
    }
}

#[async_trait]
impl CampaignTasks for SchedulerCampaignTasks {
    async fn schedule_activation(&self, campaign_id: Uuid, at: DateTime<Utc>) -> Result<Uuid> {
        self.schedule(TaskType::CampaignActivate, campaign_id, at).await
    }

    async fn schedule_completion(&self, campaign_id: Uuid, at: DateTime<Utc>) -> Result<Uuid> {
        self.schedule(TaskType::CampaignComplete, campaign_id, at).await
    }
}

/// 基于批量分发服务的作业入口实现
pub struct DispatcherCampaignJobs {
    dispatcher: Arc<BulkNotificationDispatcher>,
}

impl DispatcherCampaignJobs {
    pub fn new(dispatcher: Arc<BulkNotificationDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl CampaignJobs for DispatcherCampaignJobs {
    async fn enqueue(&self, campaign: &Campaign, channel: Channel) -> Result<Uuid> {
        self.dispatcher
            .enqueue(
                channel,
                campaign.content.clone(),
                campaign.target_filter.0.clone(),
                EnqueueOptions {
                    subject: campaign.subject.clone(),
                    campaign_id: Some(campaign.id),
                    created_by: Some(campaign.created_by.clone()),
                    ..Default::default()
                },
            )
            .await
    }

    async fn cancel_all(&self, campaign_id: Uuid) -> Result<usize> {
        let jobs = self.dispatcher.jobs_for_campaign(campaign_id).await?;
        let mut cancelled = 0usize;
        for job in jobs {
            if job.status.is_terminal() {
                continue;
            }
            if self.dispatcher.cancel_job(job.id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn totals(&self, campaign_id: Uuid) -> Result<JobTotals> {
        let jobs = self.dispatcher.jobs_for_campaign(campaign_id).await?;
        let mut totals = JobTotals {
            job_count: jobs.len(),
            ..Default::default()
        };
        for job in &jobs {
            totals.total_sent += job.total_sent as i64;
            totals.total_failed += job.total_failed as i64;
        }
        Ok(totals)
    }
}

// ---------------------------------------------------------------------------
// CampaignOrchestrator
// ---------------------------------------------------------------------------

/// 活动编排器
pub struct CampaignOrchestrator {
    store: Arc<dyn CampaignStore>,
    jobs: Arc<dyn CampaignJobs>,
    tasks: Arc<dyn CampaignTasks>,
}

impl CampaignOrchestrator {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        jobs: Arc<dyn CampaignJobs>,
        tasks: Arc<dyn CampaignTasks>,
    ) -> Self {
        Self { store, jobs, tasks }
    }

    /// 创建草稿活动
    pub async fn create(&self, campaign: NewCampaign) -> Result<Campaign> {
        let created = self.store.insert(campaign).await?;
        info!(
            campaign_id = %created.id,
            campaign_type = %created.campaign_type,
            "活动已创建"
        );
        Ok(created)
    }

    pub async fn get(&self, campaign_id: Uuid) -> Result<Campaign> {
        self.store
            .get(campaign_id)
            .await?
            .ok_or_else(|| NotifyError::NotFound {
                entity: "campaign".to_string(),
                id: campaign_id.to_string(),
            })
    }

    /// 排期活动：DRAFT → SCHEDULED
    ///
    /// start_date 在未来则安排到点激活任务，否则立即激活；
    /// end_date 存在则一并安排到点收尾任务。
    pub async fn schedule(&self, campaign_id: Uuid) -> Result<Campaign> {
        let campaign = self
            .transition_or_fail(campaign_id, &[CampaignStatus::Draft], CampaignStatus::Scheduled)
            .await?;

        if let Some(end) = campaign.end_date {
            self.tasks.schedule_completion(campaign_id, end).await?;
        }

        let now = Utc::now();
        match campaign.start_date {
            Some(start) if start > now => {
                self.tasks.schedule_activation(campaign_id, start).await?;
                info!(campaign_id = %campaign_id, start = %start, "活动已排期，等待到点激活");
                Ok(campaign)
            }
            _ => {
                info!(campaign_id = %campaign_id, "活动无未来开始时间，立即激活");
                self.activate(campaign_id).await
            }
        }
    }

    /// 激活活动：SCHEDULED/PAUSED → ACTIVE，并按通道组合创建批量作业
    pub async fn activate(&self, campaign_id: Uuid) -> Result<Campaign> {
        let campaign = self
            .transition_or_fail(
                campaign_id,
                &[CampaignStatus::Scheduled, CampaignStatus::Paused],
                CampaignStatus::Active,
            )
            .await?;

        for channel in campaign.campaign_type.channels() {
            let job_id = self.jobs.enqueue(&campaign, *channel).await?;
            info!(
                campaign_id = %campaign_id,
                channel = %channel,
                job_id = %job_id,
                "活动作业已创建"
            );
        }
        Ok(campaign)
    }

    /// 暂停活动：先尽力取消名下作业，再 ACTIVE → PAUSED
    ///
    /// 已发出的分块无法召回，取消只保证不再继续发送。
    pub async fn pause(&self, campaign_id: Uuid) -> Result<Campaign> {
        let cancelled = self.jobs.cancel_all(campaign_id).await?;
        if cancelled > 0 {
            info!(campaign_id = %campaign_id, cancelled, "已取消活动名下作业");
        }
        self.transition_or_fail(campaign_id, &[CampaignStatus::Active], CampaignStatus::Paused)
            .await
    }

    /// 取消活动
    ///
    /// 返回 true 表示本次调用完成了取消；false 表示已处于终态。
    pub async fn cancel(&self, campaign_id: Uuid) -> Result<bool> {
        let cancelled_jobs = self.jobs.cancel_all(campaign_id).await?;
        if cancelled_jobs > 0 {
            info!(campaign_id = %campaign_id, cancelled = cancelled_jobs, "已取消活动名下作业");
        }

        let updated = self
            .store
            .transition(
                campaign_id,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::Scheduled,
                    CampaignStatus::Active,
                    CampaignStatus::Paused,
                ],
                CampaignStatus::Cancelled,
            )
            .await?;

        match updated {
            Some(_) => {
                info!(campaign_id = %campaign_id, "活动已取消");
                Ok(true)
            }
            None => {
                let campaign = self.get(campaign_id).await?;
                info!(campaign_id = %campaign_id, status = %campaign.status, "活动已处于终态，取消为空操作");
                Ok(false)
            }
        }
    }

    /// 收尾活动：ACTIVE → COMPLETED（由到点收尾任务触发）
    pub async fn complete(&self, campaign_id: Uuid) -> Result<Campaign> {
        self.transition_or_fail(campaign_id, &[CampaignStatus::Active], CampaignStatus::Completed)
            .await
    }

    /// 聚合活动投放指标
    pub async fn stats(&self, campaign_id: Uuid) -> Result<CampaignStats> {
        let campaign = self.get(campaign_id).await?;
        let totals = self.jobs.totals(campaign_id).await?;

        Ok(CampaignStats {
            campaign_id,
            status: campaign.status,
            job_count: totals.job_count,
            total_sent: totals.total_sent,
            total_failed: totals.total_failed,
            delivery_rate: CampaignStats::delivery_rate_of(
                totals.total_sent,
                totals.total_failed,
            ),
        })
    }

    async fn transition_or_fail(
        &self,
        campaign_id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Campaign> {
        match self.store.transition(campaign_id, from, to).await? {
            Some(campaign) => {
                info!(campaign_id = %campaign_id, status = %to, "活动状态已更新");
                Ok(campaign)
            }
            None => {
                let campaign = self.get(campaign_id).await?;
                warn!(
                    campaign_id = %campaign_id,
                    current = %campaign.status,
                    target = %to,
                    "活动状态流转被拒绝"
                );
                Err(NotifyError::InvalidTransition {
                    entity: "campaign".to_string(),
                    from: campaign.status.to_string(),
                    to: to.to_string(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::CampaignType;
    use crate::store::MockCampaignStore;
    use chrono::Duration;
    use notify_notification_worker::recipients::RecipientFilter;

    fn campaign(
        id: Uuid,
        campaign_type: CampaignType,
        status: CampaignStatus,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Campaign {
        let now = Utc::now();
        Campaign {
            id,
            campaign_type,
            status,
            subject: Some("春季大促".to_string()),
            content: "{{name}}，大促开始了".to_string(),
            start_date,
            end_date,
            target_filter: sqlx::types::Json(RecipientFilter::default()),
            created_by: "marketing".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn orchestrator(
        store: MockCampaignStore,
        jobs: MockCampaignJobs,
        tasks: MockCampaignTasks,
    ) -> CampaignOrchestrator {
        CampaignOrchestrator::new(Arc::new(store), Arc::new(jobs), Arc::new(tasks))
    }

    #[tokio::test]
    async fn test_schedule_with_future_start_defers_activation() {
        let id = Uuid::now_v7();
        let start = Utc::now() + Duration::hours(2);
        let end = Utc::now() + Duration::days(7);

        let mut store = MockCampaignStore::new();
        store
            .expect_transition()
            .withf(|_, from, to| from == [CampaignStatus::Draft] && *to == CampaignStatus::Scheduled)
            .times(1)
            .returning(move |id, _, _| {
                Ok(Some(campaign(
                    id,
                    CampaignType::Email,
                    CampaignStatus::Scheduled,
                    Some(start),
                    Some(end),
                )))
            });

        let mut tasks = MockCampaignTasks::new();
        tasks
            .expect_schedule_activation()
            .times(1)
            .returning(|_, _| Ok(Uuid::now_v7()));
        tasks
            .expect_schedule_completion()
            .times(1)
            .returning(|_, _| Ok(Uuid::now_v7()));

        let mut jobs = MockCampaignJobs::new();
        jobs.expect_enqueue().times(0);

        let result = orchestrator(store, jobs, tasks).schedule(id).await.unwrap();
        assert_eq!(result.status, CampaignStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_schedule_without_future_start_activates_immediately() {
        let id = Uuid::now_v7();

        let mut store = MockCampaignStore::new();
        // 第一次 Draft→Scheduled，第二次 Scheduled→Active
        store.expect_transition().times(2).returning(move |id, from, _| {
            let status = if from == [CampaignStatus::Draft] {
                CampaignStatus::Scheduled
            } else {
                CampaignStatus::Active
            };
            Ok(Some(campaign(id, CampaignType::Email, status, None, None)))
        });

        let tasks = MockCampaignTasks::new();

        let mut jobs = MockCampaignJobs::new();
        jobs.expect_enqueue().times(1).returning(|_, _| Ok(Uuid::now_v7()));

        let result = orchestrator(store, jobs, tasks).schedule(id).await.unwrap();
        assert_eq!(result.status, CampaignStatus::Active);
    }

    #[tokio::test]
    async fn test_activate_mixed_campaign_creates_job_per_channel() {
        let id = Uuid::now_v7();

        let mut store = MockCampaignStore::new();
        store.expect_transition().returning(move |id, _, _| {
            Ok(Some(campaign(
                id,
                CampaignType::Mixed,
                CampaignStatus::Active,
                None,
                None,
            )))
        });

        let mut jobs = MockCampaignJobs::new();
        jobs.expect_enqueue()
            .times(3)
            .returning(|_, _| Ok(Uuid::now_v7()));

        orchestrator(store, jobs, MockCampaignTasks::new())
            .activate(id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_activate_rejects_draft_campaign() {
        let id = Uuid::now_v7();

        let mut store = MockCampaignStore::new();
        store.expect_transition().returning(|_, _, _| Ok(None));
        store.expect_get().returning(move |id| {
            Ok(Some(campaign(
                id,
                CampaignType::Email,
                CampaignStatus::Draft,
                None,
                None,
            )))
        });

        let err = orchestrator(store, MockCampaignJobs::new(), MockCampaignTasks::new())
            .activate(id)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_pause_cancels_jobs_first() {
        let id = Uuid::now_v7();

        let mut jobs = MockCampaignJobs::new();
        jobs.expect_cancel_all().times(1).returning(|_| Ok(2));

        let mut store = MockCampaignStore::new();
        store
            .expect_transition()
            .withf(|_, from, to| from == [CampaignStatus::Active] && *to == CampaignStatus::Paused)
            .returning(move |id, _, _| {
                Ok(Some(campaign(
                    id,
                    CampaignType::Promo,
                    CampaignStatus::Paused,
                    None,
                    None,
                )))
            });

        orchestrator(store, jobs, MockCampaignTasks::new())
            .pause(id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_terminal_campaign_is_noop() {
        let id = Uuid::now_v7();

        let mut jobs = MockCampaignJobs::new();
        jobs.expect_cancel_all().returning(|_| Ok(0));

        let mut store = MockCampaignStore::new();
        store.expect_transition().returning(|_, _, _| Ok(None));
        store.expect_get().returning(move |id| {
            Ok(Some(campaign(
                id,
                CampaignType::Email,
                CampaignStatus::Completed,
                None,
                None,
            )))
        });

        let cancelled = orchestrator(store, jobs, MockCampaignTasks::new())
            .cancel(id)
            .await
            .unwrap();
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn test_stats_aggregates_job_counters() {
        let id = Uuid::now_v7();

        let mut store = MockCampaignStore::new();
        store.expect_get().returning(move |id| {
            Ok(Some(campaign(
                id,
                CampaignType::Newsletter,
                CampaignStatus::Active,
                None,
                None,
            )))
        });

        let mut jobs = MockCampaignJobs::new();
        jobs.expect_totals().returning(|_| {
            Ok(JobTotals {
                job_count: 2,
                total_sent: 200,
                total_failed: 50,
            })
        });

        let stats = orchestrator(store, jobs, MockCampaignTasks::new())
            .stats(id)
            .await
            .unwrap();
        assert_eq!(stats.job_count, 2);
        assert_eq!(stats.total_sent, 200);
        assert_eq!(stats.delivery_rate, 0.75);
    }

    #[tokio::test]
    async fn test_stats_with_no_sends_has_zero_rate() {
        let id = Uuid::now_v7();

        let mut store = MockCampaignStore::new();
        store.expect_get().returning(move |id| {
            Ok(Some(campaign(
                id,
                CampaignType::Sms,
                CampaignStatus::Scheduled,
                None,
                None,
            )))
        });

        let mut jobs = MockCampaignJobs::new();
        jobs.expect_totals().returning(|_| Ok(JobTotals::default()));

        let stats = orchestrator(store, jobs, MockCampaignTasks::new())
            .stats(id)
            .await
            .unwrap();
        assert_eq!(stats.delivery_rate, 0.0);
    }
}
