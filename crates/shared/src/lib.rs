//! 共享库
//!
//! 包含调度与通知各服务共用的配置、错误处理、数据库连接、
//! 消息代理（RabbitMQ）封装、重试策略与消息信封等基础设施代码。

pub mod broker;
pub mod config;
pub mod database;
pub mod error;
pub mod messages;
pub mod observability;
pub mod retry;
pub mod test_utils;
