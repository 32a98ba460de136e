//! RabbitMQ transport over lapin.
//!
//! Messages go through the default exchange with the destination as routing key, so a
//! destination is a queue of the same name. Queues are declared non-durable,
//! non-exclusive and without auto-delete. Consumers run with `no_ack`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use tokio_util::sync::CancellationToken;

use super::{Channel, Connection, Connector, Delivery, Subscription};
use crate::error::BrokerError;

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Clone, Debug, Default)]
pub struct AmqpConnector {
    /// Connection name reported to the broker.
    pub connection_name: Option<String>,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }
        let connection = lapin::Connection::connect(address, properties)
            .await
            .map_err(|e| BrokerError::transport("dial", e))?;

        let closed = CancellationToken::new();
        let on_error = closed.clone();
        connection.on_error(move |err| {
            tracing::warn!(error = %err, "amqp connection error");
            on_error.cancel();
        });

        Ok(Arc::new(AmqpConnection { connection, closed }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    closed: CancellationToken,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::transport("open channel", e))?;

        let closed = self.closed.child_token();
        let on_error = closed.clone();
        channel.on_error(move |err| {
            tracing::warn!(error = %err, "amqp channel error");
            on_error.cancel();
        });

        Ok(Arc::new(AmqpChannel { channel, closed }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(|e| BrokerError::transport("close connection", e))
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
    closed: CancellationToken,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare(&self, destination: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                destination,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::transport("declare", e))
    }

    async fn consume(&self, destination: &str) -> Result<Subscription, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                destination,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::transport("consume", e))?;

        let tag = consumer.tag().as_str().to_string();
        let destination = destination.to_string();
        let stream = consumer
            .take_until(self.closed.clone().cancelled_owned())
            .map(move |item| {
                item.map(|delivery| Delivery {
                    destination: destination.clone(),
                    content_type: delivery
                        .properties
                        .content_type()
                        .as_ref()
                        .map(|ct| ct.as_str().to_string()),
                    body: delivery.data,
                })
                .map_err(|e| BrokerError::transport("receive", e))
            })
            .boxed();
        Ok(Subscription { tag, stream })
    }

    async fn cancel(&self, tag: &str) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::transport("cancel", e))
    }

    async fn publish(
        &self,
        destination: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                "",
                destination,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type(content_type.to_string().into()),
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| BrokerError::transport("publish", e))
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(|e| BrokerError::transport("close channel", e))
    }
}
