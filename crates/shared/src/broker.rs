//! 消息代理（RabbitMQ）基础设施封装
//!
//! 将 lapin 的底层 API 封装为业务友好的发布/消费抽象，统一消息序列化、
//! 错误映射、断线重连与消费者自动恢复语义，避免各服务重复编写样板代码。
//!
//! 可靠性模型：
//! - `connect` 无限重试（初始 5 秒，指数翻倍，封顶 60 秒），代理假定最终可达
//! - 连接异常回调立即唤醒监督任务重连，重连成功后自动重建拓扑并恢复
//!   注册表中的全部消费者，调用方无需感知
//! - 固定间隔健康探测（默认 30 秒）做一次轻量级往返兜底，失败走同一条重连路径
//! - 投递语义为至少一次：处理器返回 `Complete` 确认出队，`Retry` 否定应答
//!   并重新入队，`Discard` 拒绝且不回队；幂等性由处理器自行保证
//! - `publish`/`send_to_queue` 返回 bool 而非抛错，false 表示"不保证已投递"，
//!   重试策略属于调用层

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use tokio::sync::{Notify, RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{NotifyError, Result};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// HandlerOutcome / QueueHandler
// ---------------------------------------------------------------------------

/// 消息处理结果
///
/// 处理器用显式结果值表达确认语义，而非用异常传递"请重投"信号，
/// 使重试策略可以脱离代理客户端独立测试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// 处理完成，确认出队
    Complete,
    /// 瞬时失败，否定应答并重新入队等待重投
    Retry,
    /// 消息无法处理（如信封损坏），拒绝且不回队
    Discard,
}

/// 确认动作
///
/// `HandlerOutcome`（以及处理器返回的错误）到 AMQP 确认原语的映射，
/// 独立成纯函数便于单元测试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    NackRequeue,
    Reject,
}

/// 将处理结果翻译为确认动作
///
/// 处理器返回 Err 视为瞬时失败，等同 `Retry`——至少一次投递下
/// 宁可重复也不丢失。
pub fn ack_action(outcome: &Result<HandlerOutcome>) -> AckAction {
    match outcome {
        Ok(HandlerOutcome::Complete) => AckAction::Ack,
        Ok(HandlerOutcome::Retry) | Err(_) => AckAction::NackRequeue,
        Ok(HandlerOutcome::Discard) => AckAction::Reject,
    }
}

/// 发布确认是否成立
///
/// 代理 nack 表示消息未被接收（如队列 overflow 策略拒绝），
/// 与网络错误同样视为"不保证已投递"。
fn publish_confirmed(confirmation: &Confirmation) -> bool {
    !confirmation.is_nack()
}

/// 消费到的消息的统一表示
///
/// 将 lapin 的 Delivery（带通道所有权）转换为纯数据结构体，
/// 使处理函数可以脱离代理独立测试。
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub queue: String,
    pub payload: Vec<u8>,
    /// 代理标记的重投递标志
    pub redelivered: bool,
}

impl QueueDelivery {
    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| NotifyError::Serialization(format!("负载反序列化失败: {e}")))
    }
}

/// 队列消息处理器，由各 worker 实现
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, delivery: QueueDelivery) -> Result<HandlerOutcome>;
}

// ---------------------------------------------------------------------------
// 拓扑登记
// ---------------------------------------------------------------------------

/// 已声明的拓扑登记表
///
/// 重连后按此重建队列、交换机与绑定，保证恢复的消费者有完整拓扑可用。
#[derive(Default)]
struct Topology {
    queues: Vec<String>,
    delay_exchanges: Vec<String>,
    bindings: Vec<(String, String, String)>,
}

// ---------------------------------------------------------------------------
// MessageBroker
// ---------------------------------------------------------------------------

struct BrokerInner {
    config: BrokerConfig,
    service_name: String,
    connection: RwLock<Option<Connection>>,
    /// 发布专用通道，消费者各自持有独立通道
    publish_channel: RwLock<Option<Channel>>,
    topology: RwLock<Topology>,
    /// 队列 → 处理器注册表，重连后据此恢复消费者
    consumers: RwLock<HashMap<String, Arc<dyn QueueHandler>>>,
    connected: AtomicBool,
    /// 连接错误回调唤醒监督任务，立即重连而非等下一轮探测
    reconnect_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// 面向业务的消息代理客户端
///
/// 内部以 Arc 共享，可廉价 Clone 注入到各个服务组件。
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl MessageBroker {
    /// 连接消息代理
    ///
    /// 无限重试直到连接成功，随后启动健康探测与重连监督任务。
    /// 代理短暂不可用属于常态，不应导致服务启动失败。
    pub async fn connect(config: BrokerConfig, service_name: &str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(BrokerInner {
            config,
            service_name: service_name.to_string(),
            connection: RwLock::new(None),
            publish_channel: RwLock::new(None),
            topology: RwLock::new(Topology::default()),
            consumers: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            reconnect_notify: Notify::new(),
            shutdown_tx,
        });

        let broker = Self { inner };
        broker.reconnect_until_success().await;
        broker.spawn_supervisor();
        broker
    }

    /// 重连用的退避策略：初始 5 秒翻倍、封顶 60 秒，次数不设上限
    fn reconnect_policy(config: &BrokerConfig) -> RetryPolicy {
        RetryPolicy {
            max_retries: u32::MAX,
            initial_delay: Duration::from_secs(config.reconnect_initial_seconds),
            max_delay: Duration::from_secs(config.reconnect_max_seconds),
            multiplier: 2.0,
        }
    }

    /// 循环重连直到成功
    ///
    /// 每次成功连接后退避计数归零，下次断连重新从初始间隔开始。
    async fn reconnect_until_success(&self) {
        let policy = Self::reconnect_policy(&self.inner.config);
        let mut attempt: u32 = 0;

        loop {
            match self.connect_once().await {
                Ok(()) => {
                    info!(url = %self.inner.config.url, "消息代理连接成功");
                    return;
                }
                Err(e) => {
                    // attempt 封顶防止 2^n 溢出，延迟早已到达上限
                    let delay = policy.delay_for_attempt(attempt.min(30));
                    warn!(
                        error = %e,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "连接消息代理失败，将在退避后重试"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// 执行一次连接建立：连接 → 发布通道 → 重建拓扑 → 恢复消费者
    async fn connect_once(&self) -> Result<()> {
        let connection =
            Connection::connect(&self.inner.config.url, ConnectionProperties::default()).await?;

        // 连接层异常（心跳超时、对端关闭）直接唤醒监督任务重连
        let watcher = self.clone();
        connection.on_error(move |e| {
            warn!(error = %e, "连接异常，唤醒重连");
            watcher.signal_connection_lost();
        });

        let channel = connection.create_channel().await?;
        // 开启发布确认，使 publish 的返回值真实反映代理是否接收
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        *self.inner.connection.write().await = Some(connection);
        *self.inner.publish_channel.write().await = Some(channel);
        self.inner.connected.store(true, Ordering::SeqCst);

        self.reassert_topology().await?;
        self.respawn_consumers().await?;

        Ok(())
    }

    /// 按登记表重建全部队列、延迟交换机与绑定
    async fn reassert_topology(&self) -> Result<()> {
        let topology = self.inner.topology.read().await;
        for queue in &topology.queues {
            self.declare_queue(queue).await?;
        }
        for exchange in &topology.delay_exchanges {
            self.declare_delay_exchange(exchange).await?;
        }
        for (queue, exchange, routing_key) in &topology.bindings {
            self.declare_binding(queue, exchange, routing_key).await?;
        }
        Ok(())
    }

    /// 为注册表中的每个队列重新启动消费循环
    ///
    /// 旧连接上的消费流随连接一起失效，这里在新连接上整体重建，
    /// 调用方注册过的消费者因此无需任何恢复动作。
    async fn respawn_consumers(&self) -> Result<()> {
        let consumers = self.inner.consumers.read().await;
        for (queue, handler) in consumers.iter() {
            self.spawn_consumer(queue.clone(), handler.clone()).await?;
        }
        if !consumers.is_empty() {
            info!(count = consumers.len(), "已恢复注册表中的消费者");
        }
        Ok(())
    }

    /// 启动健康探测与重连监督任务
    fn spawn_supervisor(&self) {
        let broker = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.inner.config.health_interval_seconds);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("监督任务收到关闭信号，退出");
                            return;
                        }
                    }

                    _ = broker.inner.reconnect_notify.notified() => {
                        warn!("收到连接异常通知，进入重连流程");
                        broker.mark_disconnected().await;
                        broker.reconnect_until_success().await;
                    }

                    _ = tokio::time::sleep(interval) => {
                        if broker.health_probe().await {
                            continue;
                        }

                        warn!("健康探测失败，进入重连流程");
                        broker.mark_disconnected().await;
                        broker.reconnect_until_success().await;
                    }
                }
            }
        });
    }

    /// 轻量级健康探测：开关一个临时通道完成一次代理往返
    async fn health_probe(&self) -> bool {
        let conn_guard = self.inner.connection.read().await;
        let Some(conn) = conn_guard.as_ref() else {
            return false;
        };
        if !conn.status().connected() {
            return false;
        }

        match conn.create_channel().await {
            Ok(ch) => {
                let _ = ch.close(200, "health probe").await;
                true
            }
            Err(e) => {
                debug!(error = %e, "健康探测通道创建失败");
                false
            }
        }
    }

    /// 清除失效的连接与通道引用
    async fn mark_disconnected(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.publish_channel.write().await = None;
        *self.inner.connection.write().await = None;
    }

    /// 连接错误回调体：同步上下文内只打标记并唤醒监督任务，
    /// 连接清理与重连由监督任务完成
    fn signal_connection_lost(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.reconnect_notify.notify_one();
    }

    /// 构造一个未连接的实例，供单元测试驱动内部状态
    #[cfg(test)]
    fn detached_for_tests() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(BrokerInner {
                config: BrokerConfig::default(),
                service_name: "test".to_string(),
                connection: RwLock::new(None),
                publish_channel: RwLock::new(None),
                topology: RwLock::new(Topology::default()),
                consumers: RwLock::new(HashMap::new()),
                connected: AtomicBool::new(false),
                reconnect_notify: Notify::new(),
                shutdown_tx,
            }),
        }
    }

    /// 当前是否处于已连接状态
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // 拓扑声明
    // -----------------------------------------------------------------------

    /// 声明持久化队列并登记，重连后自动重建
    pub async fn assert_queue(&self, name: &str) -> Result<()> {
        {
            let mut topology = self.inner.topology.write().await;
            if !topology.queues.iter().any(|q| q == name) {
                topology.queues.push(name.to_string());
            }
        }
        self.declare_queue(name).await
    }

    /// 声明延迟交换机（x-delayed-message 插件）并登记
    ///
    /// 延迟消息只是延迟优化：消息可能随代理重启丢失，
    /// 正确性由调度器的补偿扫描兜底。
    pub async fn assert_delay_exchange(&self, name: &str) -> Result<()> {
        {
            let mut topology = self.inner.topology.write().await;
            if !topology.delay_exchanges.iter().any(|e| e == name) {
                topology.delay_exchanges.push(name.to_string());
            }
        }
        self.declare_delay_exchange(name).await
    }

    /// 绑定队列到交换机并登记
    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        {
            let mut topology = self.inner.topology.write().await;
            let binding = (
                queue.to_string(),
                exchange.to_string(),
                routing_key.to_string(),
            );
            if !topology.bindings.contains(&binding) {
                topology.bindings.push(binding);
            }
        }
        self.declare_binding(queue, exchange, routing_key).await
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        let channel = self.publish_channel().await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(queue = name, "队列已声明");
        Ok(())
    }

    async fn declare_delay_exchange(&self, name: &str) -> Result<()> {
        let channel = self.publish_channel().await?;
        let mut args = FieldTable::default();
        args.insert(
            "x-delayed-type".to_string().into(),
            AMQPValue::LongString("direct".to_string().into()),
        );
        channel
            .exchange_declare(
                name,
                ExchangeKind::Custom("x-delayed-message".to_string()),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;
        debug!(exchange = name, "延迟交换机已声明");
        Ok(())
    }

    async fn declare_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.publish_channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(queue, exchange, routing_key, "队列绑定已声明");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 发布
    // -----------------------------------------------------------------------

    async fn publish_channel(&self) -> Result<Channel> {
        self.inner
            .publish_channel
            .read()
            .await
            .clone()
            .ok_or_else(|| NotifyError::Broker("当前无可用通道（连接中断）".to_string()))
    }

    async fn try_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: Option<FieldTable>,
    ) -> Result<()> {
        let channel = self.publish_channel().await?;

        let mut props = BasicProperties::default().with_delivery_mode(2);
        if let Some(headers) = headers {
            props = props.with_headers(headers);
        }

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                props,
            )
            .await?
            // 等待发布确认，保证返回 true 时代理已接收
            .await?;

        if !publish_confirmed(&confirmation) {
            return Err(NotifyError::Broker(format!(
                "代理否定了发布确认: {routing_key}"
            )));
        }
        Ok(())
    }

    /// 发布消息到交换机
    ///
    /// 返回 false 表示"不保证已投递"——错误被记录但不抛出，
    /// 是否补偿由调用层决定。
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> bool {
        match self.try_publish(exchange, routing_key, payload, None).await {
            Ok(()) => {
                debug!(exchange, routing_key, "消息已发布");
                true
            }
            Err(e) => {
                error!(exchange, routing_key, error = %e, "消息发布失败");
                false
            }
        }
    }

    /// 直接发送消息到指定队列（默认交换机路由）
    pub async fn send_to_queue(&self, queue: &str, payload: &[u8]) -> bool {
        self.publish("", queue, payload).await
    }

    /// 将值序列化为 JSON 后发送到队列
    pub async fn send_json_to_queue<T: Serialize>(&self, queue: &str, value: &T) -> bool {
        let payload = match serde_json::to_vec(value) {
            Ok(p) => p,
            Err(e) => {
                error!(queue, error = %e, "消息序列化失败");
                return false;
            }
        };
        self.send_to_queue(queue, &payload).await
    }

    /// 经延迟交换机发布消息，延迟以 x-delay 头携带
    pub async fn publish_delayed(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        delay: Duration,
    ) -> bool {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-delay".to_string().into(),
            AMQPValue::LongLongInt(delay.as_millis() as i64),
        );

        match self
            .try_publish(exchange, routing_key, payload, Some(headers))
            .await
        {
            Ok(()) => {
                debug!(
                    exchange,
                    routing_key,
                    delay_ms = delay.as_millis() as u64,
                    "延迟消息已发布"
                );
                true
            }
            Err(e) => {
                error!(exchange, routing_key, error = %e, "延迟消息发布失败");
                false
            }
        }
    }

    /// 将值序列化为 JSON 后经延迟交换机发布
    pub async fn publish_json_delayed<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        delay: Duration,
    ) -> bool {
        let payload = match serde_json::to_vec(value) {
            Ok(p) => p,
            Err(e) => {
                error!(exchange, error = %e, "消息序列化失败");
                return false;
            }
        };
        self.publish_delayed(exchange, routing_key, &payload, delay)
            .await
    }

    // -----------------------------------------------------------------------
    // 消费
    // -----------------------------------------------------------------------

    /// 注册队列消费者
    ///
    /// 队列与处理器的配对进入内部注册表；断线重连后消费自动恢复，
    /// 调用方终生只需注册一次。
    pub async fn consume(&self, queue: &str, handler: Arc<dyn QueueHandler>) -> Result<()> {
        self.assert_queue(queue).await?;
        self.inner
            .consumers
            .write()
            .await
            .insert(queue.to_string(), handler.clone());

        self.spawn_consumer(queue.to_string(), handler).await
    }

    /// 在当前连接上启动一个队列的消费循环
    async fn spawn_consumer(&self, queue: String, handler: Arc<dyn QueueHandler>) -> Result<()> {
        let conn_guard = self.inner.connection.read().await;
        let conn = conn_guard
            .as_ref()
            .ok_or_else(|| NotifyError::Broker("当前无可用连接".to_string()))?;

        let channel = conn.create_channel().await?;
        // prefetch=1：单队列单活跃消费，未确认消息不会堆积
        channel
            .basic_qos(self.inner.config.prefetch, BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("{}-{}", self.inner.service_name, uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "消费者已启动");

        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut consumer = consumer;
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(queue = %queue, "消费者收到关闭信号，退出");
                            return;
                        }
                    }

                    delivery = consumer.next() => {
                        let Some(delivery) = delivery else {
                            // 流结束意味着连接已失效，重连后由注册表整体重建
                            warn!(queue = %queue, "消费流已结束，等待重连恢复");
                            return;
                        };

                        match delivery {
                            Ok(delivery) => {
                                let msg = QueueDelivery {
                                    queue: queue.clone(),
                                    payload: delivery.data.clone(),
                                    redelivered: delivery.redelivered,
                                };

                                let outcome = handler.handle(msg).await;
                                if let Err(e) = &outcome {
                                    error!(queue = %queue, error = %e, "消息处理失败，将重新入队");
                                }

                                let tag = delivery.delivery_tag;
                                let ack_result = match ack_action(&outcome) {
                                    AckAction::Ack => {
                                        channel.basic_ack(tag, BasicAckOptions::default()).await
                                    }
                                    AckAction::NackRequeue => {
                                        channel
                                            .basic_nack(
                                                tag,
                                                BasicNackOptions {
                                                    requeue: true,
                                                    ..Default::default()
                                                },
                                            )
                                            .await
                                    }
                                    AckAction::Reject => {
                                        channel
                                            .basic_reject(tag, BasicRejectOptions { requeue: false })
                                            .await
                                    }
                                };

                                if let Err(e) = ack_result {
                                    error!(queue = %queue, error = %e, "消息确认失败");
                                }
                            }
                            Err(e) => {
                                error!(queue = %queue, error = %e, "接收消息出错，等待重连恢复");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    // -----------------------------------------------------------------------
    // 队列管理
    // -----------------------------------------------------------------------

    /// 清空队列中的全部消息
    pub async fn purge_queue(&self, queue: &str) -> Result<u32> {
        let channel = self.publish_channel().await?;
        let count = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;
        info!(queue, purged = count, "队列已清空");
        Ok(count)
    }

    /// 删除队列并从登记表中移除
    pub async fn delete_queue(&self, queue: &str) -> Result<u32> {
        let channel = self.publish_channel().await?;
        let count = channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;

        let mut topology = self.inner.topology.write().await;
        topology.queues.retain(|q| q != queue);
        topology.bindings.retain(|(q, _, _)| q != queue);
        drop(topology);
        self.inner.consumers.write().await.remove(queue);

        info!(queue, "队列已删除");
        Ok(count)
    }

    /// 优雅关闭：通知所有后台任务退出并关闭连接
    pub async fn close(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.connected.store(false, Ordering::SeqCst);

        if let Some(channel) = self.inner.publish_channel.write().await.take()
            && let Err(e) = channel.close(200, "shutdown").await
        {
            warn!(error = %e, "关闭发布通道出错");
        }
        if let Some(conn) = self.inner.connection.write().await.take()
            && let Err(e) = conn.close(200, "shutdown").await
        {
            warn!(error = %e, "关闭连接出错");
        }

        info!("消息代理连接已关闭");
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
