//! lapin-backed implementation of the driver seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    QueueBindOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ConnectionProperties};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ExchangeKind;
use crate::driver::{
    CloseSignal, Delivery, Driver, DriverChannel, DriverConnection, ExchangeDeclare, QueueDeclare, Subscription,
};
use crate::endpoint::Endpoint;
use crate::error::DriverError;
use crate::message::MessageProperties;

const CHANNEL_WATCH_INTERVAL: Duration = Duration::from_millis(250);

/// Production driver speaking AMQP 0-9-1 through lapin.
#[derive(Debug, Default)]
pub struct AmqpDriver;

impl AmqpDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for AmqpDriver {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Arc<dyn DriverConnection>, DriverError> {
        let uri = endpoint.amqp_uri();
        let connection = lapin::Connection::connect(
            &uri,
            ConnectionProperties::default().with_connection_name("broker".into()),
        )
        .await?;

        let signal = CloseSignal::new();
        {
            let signal = signal.clone();
            let mut events = connection.events_listener();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if let lapin::Event::Error(error) = event {
                        warn!("⚠️ AMQP connection error: {}", error);
                        signal.notify();
                    }
                }
            });
        }

        Ok(Arc::new(AmqpConnection { connection, signal }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    signal: CloseSignal,
}

#[async_trait]
impl DriverConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn DriverChannel>, DriverError> {
        let channel = self.connection.create_channel().await?;
        let signal = CloseSignal::new();

        // lapin surfaces channel-level closure through the channel status
        // only, so a watchdog turns it into a close signal.
        {
            let watched = channel.clone();
            let signal = signal.clone();
            tokio::spawn(async move {
                loop {
                    if signal.is_closed() {
                        break;
                    }
                    if !watched.status().connected() {
                        debug!("channel {} no longer connected", watched.id());
                        signal.notify();
                        break;
                    }
                    tokio::time::sleep(CHANNEL_WATCH_INTERVAL).await;
                }
            });
        }

        Ok(Arc::new(AmqpChannel { channel, signal }))
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.connection.close(200, "Normal shutdown".into()).await?;
        self.signal.notify();
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        self.signal.wait()
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
    signal: CloseSignal,
}

#[async_trait]
impl DriverChannel for AmqpChannel {
    async fn declare_exchange(&self, declare: ExchangeDeclare) -> Result<(), DriverError> {
        self.channel
            .exchange_declare(
                declare.name.as_str().into(),
                exchange_kind(declare.kind),
                ExchangeDeclareOptions {
                    durable: declare.durable,
                    internal: declare.internal,
                    auto_delete: declare.auto_delete,
                    ..Default::default()
                },
                field_table(&declare.arguments),
            )
            .await?;
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), DriverError> {
        self.channel.exchange_delete(name.into(), ExchangeDeleteOptions::default()).await?;
        Ok(())
    }

    async fn declare_queue(&self, declare: QueueDeclare) -> Result<String, DriverError> {
        let queue = self
            .channel
            .queue_declare(
                declare.name.as_str().into(),
                QueueDeclareOptions {
                    durable: declare.durable,
                    exclusive: declare.exclusive,
                    auto_delete: declare.auto_delete,
                    ..Default::default()
                },
                field_table(&declare.arguments),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), DriverError> {
        let _message_count = self.channel.queue_delete(name.into(), QueueDeleteOptions::default()).await?;
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<(), DriverError> {
        let _message_count = self.channel.queue_purge(name.into(), QueuePurgeOptions::default()).await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DriverError> {
        self.channel
            .queue_bind(queue.into(), exchange.into(), routing_key.into(), QueueBindOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DriverError> {
        self.channel.queue_unbind(queue.into(), exchange.into(), routing_key.into(), FieldTable::default()).await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), DriverError> {
        let _confirm = self
            .channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                payload,
                basic_properties(properties),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, DriverError> {
        let mut consumer = self
            .channel
            .basic_consume(queue.into(), "".into(), BasicConsumeOptions::default(), FieldTable::default())
            .await?;
        let consumer_tag = consumer.tag().as_str().to_string();

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            redelivered: delivery.redelivered,
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            payload: Bytes::from(delivery.data),
                            properties: message_properties(&delivery.properties),
                        };
                        if sender.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("⚠️ Delivery error: {}", error);
                        break;
                    }
                }
            }
        });

        Ok(Subscription { consumer_tag, deliveries: receiver })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), DriverError> {
        self.channel.basic_cancel(consumer_tag.into(), BasicCancelOptions::default()).await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), DriverError> {
        self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), DriverError> {
        self.channel.basic_nack(delivery_tag, BasicNackOptions { multiple: false, requeue }).await?;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), DriverError> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.channel.close(200, "Normal shutdown".into()).await?;
        self.signal.notify();
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        self.signal.wait()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn field_table(arguments: &HashMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(key.as_str().into(), amqp_value(value));
    }
    table
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::String(text) => AMQPValue::LongString(text.as_str().into()),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                AMQPValue::LongLongInt(int)
            } else {
                AMQPValue::Double(number.as_f64().unwrap_or_default())
            }
        }
        other => AMQPValue::LongString(other.to_string().into()),
    }
}

fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::LongString(text) => Value::String(String::from_utf8_lossy(text.as_bytes()).into_owned()),
        AMQPValue::ShortShortInt(int) => Value::from(*int),
        AMQPValue::ShortShortUInt(int) => Value::from(*int),
        AMQPValue::ShortInt(int) => Value::from(*int),
        AMQPValue::ShortUInt(int) => Value::from(*int),
        AMQPValue::LongInt(int) => Value::from(*int),
        AMQPValue::LongUInt(int) => Value::from(*int),
        AMQPValue::LongLongInt(int) => Value::from(*int),
        AMQPValue::Float(float) => Value::from(*float),
        AMQPValue::Double(double) => Value::from(*double),
        AMQPValue::Timestamp(timestamp) => Value::from(*timestamp),
        _ => Value::Null,
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        out = out.with_content_type(content_type.as_str().into());
    }
    if let Some(content_encoding) = &properties.content_encoding {
        out = out.with_content_encoding(content_encoding.as_str().into());
    }
    if let Some(headers) = &properties.headers {
        out = out.with_headers(field_table(headers));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        out = out.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        out = out.with_reply_to(reply_to.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        out = out.with_message_id(message_id.as_str().into());
    }
    if let Some(timestamp) = properties.timestamp {
        out = out.with_timestamp(timestamp);
    }
    if let Some(kind) = &properties.kind {
        out = out.with_type(kind.as_str().into());
    }
    if let Some(app_id) = &properties.app_id {
        out = out.with_app_id(app_id.as_str().into());
    }
    if let Some(expiration) = &properties.expiration {
        out = out.with_expiration(expiration.as_str().into());
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        out = out.with_delivery_mode(delivery_mode);
    }
    out
}

fn message_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: properties.content_type().as_ref().map(|value| value.as_str().to_string()),
        content_encoding: properties.content_encoding().as_ref().map(|value| value.as_str().to_string()),
        headers: properties.headers().as_ref().map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), json_value(value)))
                .collect()
        }),
        correlation_id: properties.correlation_id().as_ref().map(|value| value.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|value| value.as_str().to_string()),
        message_id: properties.message_id().as_ref().map(|value| value.as_str().to_string()),
        timestamp: *properties.timestamp(),
        kind: properties.kind().as_ref().map(|value| value.as_str().to_string()),
        app_id: properties.app_id().as_ref().map(|value| value.as_str().to_string()),
        expiration: properties.expiration().as_ref().map(|value| value.as_str().to_string()),
        delivery_mode: *properties.delivery_mode(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_table_conversion() {
        let arguments = HashMap::from([
            ("x-dead-letter-exchange".to_string(), json!("dlx")),
            ("x-message-ttl".to_string(), json!(60000)),
            ("x-single-active-consumer".to_string(), json!(true)),
        ]);
        let table = field_table(&arguments);
        assert_eq!(table.inner().get("x-dead-letter-exchange"), Some(&AMQPValue::LongString("dlx".into())));
        assert_eq!(table.inner().get("x-message-ttl"), Some(&AMQPValue::LongLongInt(60000)));
        assert_eq!(table.inner().get("x-single-active-consumer"), Some(&AMQPValue::Boolean(true)));
    }

    #[test]
    fn test_property_round_trip() {
        let properties = MessageProperties::default()
            .with_content_type("application/json")
            .with_correlation_id("corr-1")
            .with_message_id("msg-1")
            .with_timestamp(1700000000000)
            .with_kind("event")
            .with_app_id("svc:1")
            .with_delivery_mode(2);
        let round_tripped = message_properties(&basic_properties(&properties));
        assert_eq!(round_tripped, properties);
    }
}
