use super::{Acker, Connector, Delivery, ExchangeKind, Session, SessionHandle, Topology};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

#[derive(Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        topology: &Topology,
        consumer_tag: &str,
    ) -> Result<Session, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;

        let (closed_tx, closed) = oneshot::channel();
        let closed_tx = Mutex::new(Some(closed_tx));
        connection.on_error(move |err| {
            let sender = closed_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(BrokerError::Amqp(err));
            }
        });

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(topology.prefetch, BasicQosOptions::default())
            .await?;

        channel
            .exchange_declare(
                &topology.exchange,
                topology.exchange_kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::debug!(
            exchange = %topology.exchange,
            kind = topology.exchange_kind.as_str(),
            "declared exchange"
        );

        let mut queue_args = FieldTable::default();
        if let Some(dlx) = topology.dead_letter_exchange.as_deref() {
            queue_args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.into()),
            );
        }
        channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_args,
            )
            .await?;

        let exchanges = std::iter::once(topology.exchange.as_str())
            .chain(topology.extra_bindings.iter().map(String::as_str));
        for exchange in exchanges {
            channel
                .queue_bind(
                    &topology.queue,
                    exchange,
                    &topology.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            tracing::debug!(
                queue = %topology.queue,
                exchange,
                routing_key = %topology.routing_key,
                "bound queue"
            );
        }

        let consumer = channel
            .basic_consume(
                &topology.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer
            .map(|next| next.map(into_delivery).map_err(BrokerError::from))
            .boxed();

        Ok(Session {
            deliveries,
            closed,
            handle: Arc::new(AmqpSession { connection }),
        })
    }
}

struct AmqpSession {
    connection: Connection,
}

#[async_trait]
impl SessionHandle for AmqpSession {
    async fn close(&self) {
        if !self.connection.status().connected() {
            return;
        }
        if let Err(err) = self.connection.close(200, "consumer closing").await {
            tracing::debug!(error = %err, "error closing broker connection");
        }
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let delivery_count = delivery_count(&delivery.properties, delivery.redelivered);
    Delivery {
        message_id: message_id(&delivery.properties),
        body: delivery.data,
        delivery_count,
        acker: Box::new(AmqpAcker(delivery.acker)),
    }
}

fn message_id(properties: &BasicProperties) -> Option<String> {
    properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().trim().to_string())
        .filter(|id| !id.is_empty())
}

// Quorum queues report prior deliveries in a header; classic queues only
// expose the redelivered flag.
fn delivery_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    let from_header = properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
            .and_then(|(_, value)| header_count(value))
    });
    match from_header {
        Some(previous) => previous.saturating_add(1),
        None if redelivered => 2,
        None => 1,
    }
}

fn header_count(value: &AMQPValue) -> Option<u32> {
    let count = match value {
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        _ => return None,
    };
    u32::try_from(count).ok()
}
