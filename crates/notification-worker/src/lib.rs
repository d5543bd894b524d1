//! 通知发送与批量分发服务
//!
//! 单通道发送（校验、限流、净化、落库、投递）与批量分发
//! （收件人解析、分块串行、计数上报）两层，经作业队列解耦。

pub mod channels;
pub mod dispatcher;
pub mod job;
pub mod rate_limit;
pub mod recipients;
pub mod sanitize;
pub mod sender;
pub mod template;
