//! 任务处理器注册表
//!
//! 处理器按任务类型枚举注册，未注册的类型在编译期就不存在，
//! 不会出现运行时字符串分支落空的情况。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use notify_shared::error::Result;
use notify_shared::messages::TaskType;

use crate::task::Task;

/// 任务处理器，由各业务服务实现并注册
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 执行任务
    ///
    /// 返回 Err 表示本次尝试失败，由 worker 按重试策略决定
    /// 是退避重试还是标记 FAILED。实现必须幂等：至少一次投递
    /// 下同一任务可能被执行多次。
    async fn execute(&self, task: &Task) -> Result<()>;
}

/// 枚举键处理器注册表
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同类型重复注册以后者为准
    pub fn register(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type, handler);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_get() {
        let handler = MockTaskHandler::new();
        let registry = HandlerRegistry::new().register(TaskType::BulkDispatch, Arc::new(handler));

        assert!(registry.get(TaskType::BulkDispatch).is_some());
        assert!(registry.get(TaskType::CampaignActivate).is_none());
    }

    #[test]
    fn test_registry_last_registration_wins() {
        let registry = HandlerRegistry::new()
            .register(TaskType::Custom, Arc::new(MockTaskHandler::new()))
            .register(TaskType::Custom, Arc::new(MockTaskHandler::new()));

        assert!(registry.get(TaskType::Custom).is_some());
        assert!(!registry.is_empty());
    }
}
