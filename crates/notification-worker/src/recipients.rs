//! 收件人解析
//!
//! 批量作业用声明式过滤器圈定目标人群，解析为具体收件人列表。
//! 过滤器在作业创建时落库，worker 执行时才解析，两个时刻的人群
//! 可能不同——以执行时刻为准。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use notify_shared::error::Result;

/// 通知收件人
///
/// 姓名与邮箱在用户表里均可缺省，渲染与通道校验各自兜底。
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Recipient {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// 声明式收件人过滤器
///
/// 空过滤器解析为默认人群：已验证且订阅了通知的用户。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecipientFilter {
    /// 角色限定（如 buyer / seller / admin）
    pub role: Option<String>,
    /// 是否已验证；None 时沿用默认人群的"已验证"限定
    pub verified: Option<bool>,
    /// 注册时间范围
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// 最近登录晚于
    pub last_login_after: Option<DateTime<Utc>>,
    /// 是否有在售商品
    pub has_listings: Option<bool>,
    /// 显式收件人白名单，命中后其余条件仍然生效
    pub user_ids: Vec<Uuid>,
    /// 兴趣分类（任意命中）
    pub interests: Vec<String>,
}

impl RecipientFilter {
    /// 是否未施加任何条件
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// 收件人仓储抽象
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecipientRepository: Send + Sync {
    /// 按过滤器解析收件人，顺序稳定（按注册时间）
    async fn resolve(&self, filter: &RecipientFilter) -> Result<Vec<Recipient>>;
}

/// PostgreSQL 实现，把过滤器编译为单条查询
pub struct PgRecipientRepository {
    pool: PgPool,
}

impl PgRecipientRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn build_query(filter: &RecipientFilter) -> QueryBuilder<'_, sqlx::Postgres> {
        let mut qb: QueryBuilder<'_, sqlx::Postgres> =
            QueryBuilder::new("SELECT id, name, email, phone FROM users WHERE opted_in = TRUE");

        // 默认人群限定已验证；过滤器显式给出 verified 时以过滤器为准
        match filter.verified {
            Some(v) => {
                qb.push(" AND verified = ").push_bind(v);
            }
            None => {
                qb.push(" AND verified = TRUE");
            }
        }

        if let Some(role) = &filter.role {
            qb.push(" AND role = ").push_bind(role.clone());
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at <= ").push_bind(before);
        }
        if let Some(after) = filter.last_login_after {
            qb.push(" AND last_login_at >= ").push_bind(after);
        }
        if let Some(has) = filter.has_listings {
            if has {
                qb.push(" AND EXISTS (SELECT 1 FROM listings l WHERE l.seller_id = users.id)");
            } else {
                qb.push(" AND NOT EXISTS (SELECT 1 FROM listings l WHERE l.seller_id = users.id)");
            }
        }
        if !filter.user_ids.is_empty() {
            qb.push(" AND id = ANY(").push_bind(filter.user_ids.clone()).push(")");
        }
        if !filter.interests.is_empty() {
            qb.push(" AND interests && ").push_bind(filter.interests.clone());
        }

        qb.push(" ORDER BY created_at ASC");
        qb
    }
}

#[async_trait]
impl RecipientRepository for PgRecipientRepository {
    async fn resolve(&self, filter: &RecipientFilter) -> Result<Vec<Recipient>> {
        let mut qb = Self::build_query(filter);
        let rows = qb.build_query_as::<Recipient>().fetch_all(&self.pool).await?;
        Ok(rows)
    }
}
