//! 补偿扫描
//!
//! 延迟交换机只是低延迟优化，延迟中的消息会随代理重启丢失。
//! 扫描按固定间隔查询已到期仍为 PENDING 的任务，以及滞留在
//! PROCESSING 超过阈值的任务（执行方崩溃遗留），重新投递信封恢复
//! 调度正确性。投递是幂等信号，偶尔与延迟消息重复无害——worker
//! 的受保护状态转换保证同一任务只会被执行一次。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use notify_shared::config::SchedulerConfig;
use notify_shared::error::Result;

use crate::scheduler::TaskPublisher;
use crate::store::TaskStore;

/// 单轮扫描的任务上限，防止积压时单轮占用过久
const SWEEP_BATCH_LIMIT: i64 = 500;

pub struct Sweeper {
    store: Arc<dyn TaskStore>,
    publisher: Arc<dyn TaskPublisher>,
    interval: Duration,
    stale_after: chrono::Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        publisher: Arc<dyn TaskPublisher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            interval: Duration::from_secs(config.sweep_interval_seconds),
            stale_after: chrono::Duration::seconds(config.stale_processing_seconds as i64),
        }
    }

    /// 扫描循环，收到关闭信号后退出
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "补偿扫描已启动");
        let mut ticker = tokio::time::interval(self.interval);
        // 启动时立即扫一轮，尽快补上停机期间丢失的投递
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("补偿扫描收到关闭信号，退出");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "本轮补偿扫描失败，下轮重试");
                    }
                }
            }
        }
    }

    /// 执行一轮扫描，返回重新投递的任务数
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = chrono::Utc::now();
        let mut candidates = self
            .store
            .list_due_pending(now, SWEEP_BATCH_LIMIT)
            .await?;

        // 滞留的 PROCESSING 任务：执行方崩溃后不会再有任何投递，
        // 超过阈值后由扫描重新投递，worker 侧负责重新认领
        let stale = self
            .store
            .list_stale_processing(now - self.stale_after, SWEEP_BATCH_LIMIT)
            .await?;
        if !stale.is_empty() {
            warn!(stale = stale.len(), "发现滞留的 PROCESSING 任务，重新投递");
            candidates.extend(stale);
        }

        if candidates.is_empty() {
            debug!("无到期待投递任务");
            return Ok(0);
        }

        let mut published = 0usize;
        for task in &candidates {
            if self.publisher.publish_ready(&task.to_message()).await {
                published += 1;
            } else {
                warn!(task_id = %task.id, "补偿投递未确认，下轮重试");
            }
        }

        info!(due = candidates.len(), published, "补偿扫描完成");
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MockTaskPublisher;
    use crate::store::MockTaskStore;
    use crate::task::Task;
    use chrono::Utc;
    use notify_shared::messages::{TaskStatus, TaskType};
    use uuid::Uuid;

    fn due_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::now_v7(),
            task_type: TaskType::CampaignComplete,
            payload: serde_json::json!({}),
            scheduled_for: now - chrono::Duration::minutes(2),
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            last_attempt_at: None,
            completed_at: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_sweep_republishes_due_tasks() {
        let mut store = MockTaskStore::new();
        store
            .expect_list_due_pending()
            .returning(|_, _| Ok(vec![due_task(), due_task()]));
        store
            .expect_list_stale_processing()
            .returning(|_, _| Ok(vec![]));

        let mut publisher = MockTaskPublisher::new();
        publisher
            .expect_publish_ready()
            .times(2)
            .returning(|_| true);

        let sweeper = Sweeper::new(
            Arc::new(store),
            Arc::new(publisher),
            &SchedulerConfig::default(),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sweep_counts_only_confirmed_publishes() {
        let mut store = MockTaskStore::new();
        store
            .expect_list_due_pending()
            .returning(|_, _| Ok(vec![due_task(), due_task(), due_task()]));
        store
            .expect_list_stale_processing()
            .returning(|_, _| Ok(vec![]));

        let mut publisher = MockTaskPublisher::new();
        let mut calls = 0;
        publisher.expect_publish_ready().returning(move |_| {
            calls += 1;
            calls != 2
        });

        let sweeper = Sweeper::new(
            Arc::new(store),
            Arc::new(publisher),
            &SchedulerConfig::default(),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sweep_republishes_stale_processing_tasks() {
        let mut store = MockTaskStore::new();
        store.expect_list_due_pending().returning(|_, _| Ok(vec![]));
        store.expect_list_stale_processing().returning(|cutoff, _| {
            // 阈值之前仍在 PROCESSING 的任务会被捞出
            assert!(cutoff < Utc::now());
            let mut task = due_task();
            task.status = TaskStatus::Processing;
            task.attempts = 1;
            task.last_attempt_at = Some(Utc::now() - chrono::Duration::minutes(30));
            Ok(vec![task])
        });

        let mut publisher = MockTaskPublisher::new();
        publisher
            .expect_publish_ready()
            .withf(|msg| msg.status == TaskStatus::Processing)
            .times(1)
            .returning(|_| true);

        let sweeper = Sweeper::new(
            Arc::new(store),
            Arc::new(publisher),
            &SchedulerConfig::default(),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_empty_is_quiet() {
        let mut store = MockTaskStore::new();
        store.expect_list_due_pending().returning(|_, _| Ok(vec![]));
        store
            .expect_list_stale_processing()
            .returning(|_, _| Ok(vec![]));

        let publisher = MockTaskPublisher::new();
        let sweeper = Sweeper::new(
            Arc::new(store),
            Arc::new(publisher),
            &SchedulerConfig::default(),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }
}
