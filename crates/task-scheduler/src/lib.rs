//! 延迟任务调度服务
//!
//! 以数据库为权威状态、延迟交换机为低延迟投递路径的持久化任务调度器。
//! 到期任务经就绪队列交给按任务类型注册的处理器执行，失败按指数退避
//! 重试；补偿扫描兜底代理重启导致的延迟消息丢失。

pub mod handler;
pub mod scheduler;
pub mod store;
pub mod sweeper;
pub mod task;
pub mod worker;
