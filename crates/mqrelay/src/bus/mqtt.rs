//! MQTT transport backed by rumqttc.
//!
//! `connect` drives the event loop until the broker acknowledges the
//! connection, so an unreachable broker fails at startup. After that a
//! background task owns the event loop and hands every inbound publish to
//! the registered handler. The adapter does not reconnect: once the event
//! loop reports an error the task exits and publishes start failing.

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

use super::{InboundMessage, MessageHandler, Transport, TransportError};
use crate::config::BrokerConfig;

pub struct MqttTransport {
    client: AsyncClient,
    endpoint: String,
    event_loop: JoinHandle<()>,
}

impl MqttTransport {
    /// Connect to the broker and start delivering messages to `handler`.
    pub async fn connect(
        config: &BrokerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, TransportError> {
        let endpoint = config.endpoint();
        let client_id = config.client_id();

        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

        let (client, mut event_loop) = AsyncClient::new(options, config.capacity);

        tracing::info!(%endpoint, %client_id, "Connecting to broker");

        match tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut event_loop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(TransportError::Connection { endpoint, reason });
            }
            Err(_) => {
                return Err(TransportError::Connection {
                    endpoint,
                    reason: format!("no CONNACK within {:?}", config.connect_timeout),
                });
            }
        }

        tracing::info!(%endpoint, "Connected to broker");
        handler.on_connect();

        let event_loop = tokio::spawn(run_event_loop(event_loop, handler));

        Ok(Self {
            client,
            endpoint,
            event_loop,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.event_loop.is_finished()
    }

    /// Send DISCONNECT and stop the event loop.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "Disconnect request not delivered");
        }
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), String> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("connection refused: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn run_event_loop(mut event_loop: EventLoop, handler: Arc<dyn MessageHandler>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "Received publish");
                handler.on_message(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                handler.on_disconnect("broker sent DISCONNECT");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                handler.on_disconnect(&e.to_string());
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: filter.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(filter, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::Unsubscribe {
                topic: filter.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(filter, "Unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let bytes = payload.len();
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        tracing::trace!(topic, bytes, "Published");
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
