//! Bus Subscriber State Machine
//!
//! One task owns the AMQP session and walks CONNECT → OPEN_CHANNEL →
//! DECLARE → CONSUME → DELIVER; any failure falls back to CONNECT after a
//! retry pause. The queue is ephemeral and per-instance, so events
//! published while disconnected are lost by design - refresh is
//! at-most-once, with TTL expiry as the eventual-consistency backstop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Exchange used by Spring Cloud Bus for refresh events
const EXCHANGE_NAME: &str = "springCloudBus";

/// Only events of this type are actionable
const REFRESH_EVENT_TYPE: &str = "RefreshRemoteApplicationEvent";

/// Bind-everything routing key
const ROUTING_KEY: &str = "#";

const DELIVERY_BUFFER: usize = 16;

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// AMQP broker URL
    pub amqp_url: String,
    /// Consumer tag; also prefixes the per-instance queue name
    pub consumer_tag: String,
    /// Log every delivery
    pub debug: bool,
    /// Bus dial timeout
    pub dial_timeout: Duration,
    /// Pause before reconnecting after a failed session
    pub dial_retry_interval: Duration,
}

impl RefreshConfig {
    /// Config with the standard dial timings
    pub fn new(amqp_url: impl Into<String>, consumer_tag: impl Into<String>, debug: bool) -> Self {
        Self {
            amqp_url: amqp_url.into(),
            consumer_tag: consumer_tag.into(),
            debug,
            dial_timeout: Duration::from_secs(10),
            dial_retry_interval: Duration::from_secs(5),
        }
    }
}

/// Handle to a running subscriber
pub struct RefreshHandle {
    close_tx: watch::Sender<bool>,
    exited: Arc<AtomicBool>,
}

impl RefreshHandle {
    /// Interrupt the subscriber; it exits its session cleanly and closes
    /// the delivery channel. Idempotent.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Whether the subscriber task has finished
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Durable bus consumer delivering application patterns from refresh events.
pub struct RefreshSubscriber;

impl RefreshSubscriber {
    /// Spawn the subscriber task. Returns a control handle and the
    /// delivery channel; the channel closes when the subscriber exits.
    pub fn spawn(config: RefreshConfig) -> (RefreshHandle, mpsc::Receiver<String>) {
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_BUFFER);
        let (close_tx, close_rx) = watch::channel(false);
        let exited = Arc::new(AtomicBool::new(false));

        let task_exited = Arc::clone(&exited);
        tokio::spawn(async move {
            serve(config, delivery_tx, close_rx).await;
            task_exited.store(true, Ordering::SeqCst);
        });

        (RefreshHandle { close_tx, exited }, delivery_rx)
    }
}

/// Closed when the handle asked for it or was dropped entirely.
fn is_closed(closed: &watch::Receiver<bool>) -> bool {
    *closed.borrow() || closed.has_changed().is_err()
}

/// Reconnect loop: one bus session per iteration, forever until closed.
async fn serve(config: RefreshConfig, delivery_tx: mpsc::Sender<String>, mut closed: watch::Receiver<bool>) {
    let mut connection_count: u64 = 0;

    while !is_closed(&closed) {
        connection_count += 1;
        let begin = Instant::now();

        match serve_once(&config, &delivery_tx, &mut closed).await {
            Ok(()) => {}
            Err(e) => warn!(
                conn = connection_count,
                uptime = ?begin.elapsed(),
                error = %e,
                "bus session failed"
            ),
        }

        if is_closed(&closed) {
            break;
        }

        info!(
            conn = connection_count,
            uptime = ?begin.elapsed(),
            retry_in = ?config.dial_retry_interval,
            "restarting bus connection"
        );
        tokio::select! {
            _ = tokio::time::sleep(config.dial_retry_interval) => {}
            _ = closed.changed() => {}
        }
    }

    debug!("refresh subscriber closed, exiting");
    // delivery_tx drops here, closing the channel for the reader
}

/// One bus session: dial, open a channel, declare, consume, deliver.
async fn serve_once(
    config: &RefreshConfig,
    delivery_tx: &mpsc::Sender<String>,
    closed: &mut watch::Receiver<bool>,
) -> Result<()> {
    // CONNECT
    let connecting = Connection::connect(&config.amqp_url, ConnectionProperties::default());
    let connection = tokio::select! {
        result = tokio::time::timeout(config.dial_timeout, connecting) => {
            result.map_err(|_| Error::Unavailable("bus dial timeout".to_string()))??
        }
        _ = closed.changed() => return Ok(()),
    };

    // OPEN_CHANNEL
    let channel = connection.create_channel().await?;

    // DECLARE
    channel
        .exchange_declare(
            EXCHANGE_NAME,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let queue_name = format!("{}.{}", config.consumer_tag, uuid::Uuid::new_v4().simple());
    let queue = channel
        .queue_declare(
            &queue_name,
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            queue.name().as_str(),
            EXCHANGE_NAME,
            ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    // CONSUME
    let mut consumer = channel
        .basic_consume(
            queue.name().as_str(),
            &config.consumer_tag,
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    info!(
        exchange = EXCHANGE_NAME,
        queue = %queue_name,
        consumer_tag = %config.consumer_tag,
        "consuming bus events"
    );

    // DELIVER
    loop {
        tokio::select! {
            delivery = consumer.next() => {
                let delivery = match delivery {
                    Some(d) => d?,
                    None => return Err(Error::Unavailable("consume stream closed".to_string())),
                };
                if config.debug {
                    debug!(
                        routing_key = %delivery.routing_key.as_str(),
                        size = delivery.data.len(),
                        "bus delivery"
                    );
                }
                match decode_event(&delivery.data) {
                    Ok(Some(destination)) => {
                        if delivery_tx.send(destination).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    // Never crash the subscriber on a bad payload.
                    Err(e) => debug!(error = %e, "dropping undecodable bus message"),
                }
            }
            _ = closed.changed() => {
                let _ = channel
                    .basic_cancel(&config.consumer_tag, BasicCancelOptions::default())
                    .await;
                return Ok(());
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct BusEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(rename = "destinationService")]
    destination_service: Option<String>,
}

/// Decode a bus message into the destination application pattern.
///
/// A payload that fails JSON parsing is a decode error for the caller to
/// drop; unknown JSON fields are ignored. `Ok(None)` means a well-formed
/// message that is not an actionable refresh event (other event types,
/// missing `destinationService`).
pub fn decode_event(body: &[u8]) -> Result<Option<String>> {
    let event: BusEvent = serde_json::from_slice(body)?;

    if event.event_type != REFRESH_EVENT_TYPE {
        debug!(event_type = %event.event_type, "ignoring bus event");
        return Ok(None);
    }

    match event.destination_service {
        Some(destination) => Ok(Some(destination)),
        None => {
            debug!("refresh event without destinationService");
            Ok(None)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
