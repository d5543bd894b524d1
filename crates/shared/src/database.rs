//! 数据库连接池管理
//!
//! 统一各服务的 PostgreSQL 连接池创建与迁移入口。

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{NotifyError, Result};
use crate::retry::{RetryPolicy, retry_with_policy};

/// 按配置创建连接池
///
/// 启动窗口内数据库短暂不可达属于常态（容器编排下的启动顺序抖动），
/// 按默认退避策略重试若干次后才放弃。
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let policy = RetryPolicy::default();
    let pool = retry_with_policy(&policy, "db_connect", NotifyError::is_retryable, || async {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;
        Ok(pool)
    })
    .await?;

    info!(
        max_connections = config.max_connections,
        "数据库连接池已创建"
    );
    Ok(pool)
}

/// 连接健康检查，供就绪探测使用
pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
