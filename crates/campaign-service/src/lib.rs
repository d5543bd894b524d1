//! 营销活动编排服务
//!
//! 活动是调度与批量分发之上的编排层：按生命周期流转活动状态，
//! 将通道组合展开为具体批量作业，并聚合作业计数为活动指标。

pub mod campaign;
pub mod handlers;
pub mod orchestrator;
pub mod store;
