//! 测试辅助工具
//!
//! 供各 crate 的单元测试构造常用对象，避免重复的样板初始化。

use chrono::Utc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::messages::{Channel, JobMessage, JobStatus, TaskMessage, TaskStatus, TaskType};

/// 构造一条立即到期的任务消息
pub fn make_task_message(task_type: TaskType) -> TaskMessage {
    TaskMessage {
        id: Uuid::now_v7().to_string(),
        task_type,
        payload: serde_json::json!({}),
        scheduled_for: Utc::now(),
        status: TaskStatus::Pending,
        attempts: 0,
        max_attempts: 3,
    }
}

/// 构造一条待处理的作业消息
pub fn make_job_message(channel: Channel) -> JobMessage {
    JobMessage {
        id: Uuid::now_v7().to_string(),
        channel,
        content: "测试通知内容".to_string(),
        variables: std::collections::HashMap::new(),
        status: JobStatus::Pending,
    }
}

/// 测试用配置，全部取默认值
pub fn test_config(service_name: &str) -> AppConfig {
    AppConfig {
        service_name: service_name.to_string(),
        environment: "test".to_string(),
        ..Default::default()
    }
}
