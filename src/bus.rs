//! Event bus adapter over NATS JetStream.
//!
//! Durable topic-partitioned streams with at-least-once delivery. Publishes
//! deduplicate on the envelope's `event_id` (`Nats-Msg-Id`); consumers retry
//! with a bounded backoff schedule and dead-letter once the delivery budget
//! is spent.

use std::future::Future;
use std::time::Duration;

use async_nats::header::NATS_MESSAGE_ID;
use async_nats::jetstream::{self, consumer::pull, consumer::DeliverPolicy, stream, AckKind};
use futures::StreamExt;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::events::{DeadLetter, Envelope};

pub const STREAM_BOOKINGS: &str = "BOOKINGS";
pub const STREAM_DOCUMENTS: &str = "DOCUMENTS";
pub const STREAM_NOTIFICATIONS: &str = "NOTIFICATIONS";
pub const STREAM_DEAD_LETTER: &str = "DEAD_LETTER";

/// Publisher-side deduplication window shared by every stream.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(120);

pub const ACK_WAIT_DEFAULT: Duration = Duration::from_secs(30);
/// Consumers that make outbound HTTP calls get a longer budget.
pub const ACK_WAIT_EXTERNAL: Duration = Duration::from_secs(60);
/// The real-time fan-out turns around quickly or not at all.
pub const ACK_WAIT_REALTIME: Duration = Duration::from_secs(5);

pub const DEFAULT_MAX_DELIVER: i64 = 5;

const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

/// Redelivery delay for the given failed attempt (1-based), clamped to the
/// schedule length.
pub fn backoff_delay(attempt: i64) -> Duration {
    let idx = (attempt.max(1) as usize - 1).min(BACKOFF_SCHEDULE.len() - 1);
    BACKOFF_SCHEDULE[idx]
}

#[derive(Clone)]
pub struct EventBus {
    js: jetstream::Context,
}

struct StreamSpec {
    name: &'static str,
    subjects: &'static [&'static str],
    max_age: Duration,
    retention: stream::RetentionPolicy,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

const STREAMS: [StreamSpec; 4] = [
    StreamSpec {
        name: STREAM_BOOKINGS,
        subjects: &["slot.held", "slot.released", "booking.confirmed", "booking.canceled"],
        max_age: Duration::from_secs(7 * 24 * 60 * 60),
        retention: stream::RetentionPolicy::Limits,
    },
    StreamSpec {
        name: STREAM_DOCUMENTS,
        subjects: &["nda.created", "nda.sent", "nda.signed", "nda.expired"],
        max_age: Duration::from_secs(30 * 24 * 60 * 60),
        retention: stream::RetentionPolicy::Limits,
    },
    StreamSpec {
        name: STREAM_NOTIFICATIONS,
        subjects: &["notify.email.requested", "notify.email.sent"],
        max_age: DAY,
        retention: stream::RetentionPolicy::WorkQueue,
    },
    StreamSpec {
        name: STREAM_DEAD_LETTER,
        subjects: &["dlq.>"],
        max_age: Duration::from_secs(90 * 24 * 60 * 60),
        retention: stream::RetentionPolicy::Limits,
    },
];

impl EventBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Bus(format!("connect {url}: {e}")))?;
        Ok(EventBus { js: jetstream::new(client) })
    }

    /// Idempotently declares the four streams. Run once at startup.
    pub async fn ensure_streams(&self) -> Result<()> {
        for spec in &STREAMS {
            self.js
                .get_or_create_stream(stream::Config {
                    name: spec.name.to_string(),
                    subjects: spec.subjects.iter().map(|s| s.to_string()).collect(),
                    max_age: spec.max_age,
                    retention: spec.retention,
                    duplicate_window: DEDUP_WINDOW,
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::Bus(format!("ensure stream {}: {e}", spec.name)))?;
        }
        Ok(())
    }

    /// Publishes an envelope on its subject, deduplicated by `event_id`,
    /// and waits for the stream's ack.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| Error::Bus(format!("encode {}: {e}", envelope.subject())))?;
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(NATS_MESSAGE_ID, envelope.event_id.to_string().as_str());
        self.js
            .publish_with_headers(envelope.subject().to_string(), headers, payload.into())
            .await
            .map_err(|e| Error::Bus(format!("publish {}: {e}", envelope.subject())))?
            .await
            .map_err(|e| Error::Bus(format!("publish ack {}: {e}", envelope.subject())))?;
        tracing::debug!(subject = envelope.subject(), event_id = %envelope.event_id, "published");
        Ok(())
    }

    /// Post-commit, best-effort publish for request paths. The database
    /// state is authoritative; a dropped event is healed by the client's
    /// next listing.
    pub async fn publish_logged(&self, envelope: &Envelope) {
        if let Err(e) = self.publish(envelope).await {
            tracing::warn!(subject = envelope.subject(), error = %e, "event emission failed");
        }
    }

    async fn publish_dead_letter(&self, entry: &DeadLetter, event_id: &str) -> Result<()> {
        let subject = format!("dlq.{}", entry.original_subject);
        let payload = serde_json::to_vec(entry)
            .map_err(|e| Error::Bus(format!("encode dead letter: {e}")))?;
        let mut headers = async_nats::HeaderMap::new();
        // Distinct id space so the dead letter dedups independently of the
        // original publish.
        headers.insert(NATS_MESSAGE_ID, format!("dlq-{event_id}").as_str());
        self.js
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| Error::Bus(format!("publish {subject}: {e}")))?
            .await
            .map_err(|e| Error::Bus(format!("publish ack {subject}: {e}")))?;
        Ok(())
    }

    pub async fn stream(&self, name: &str) -> Result<stream::Stream> {
        self.js
            .get_stream(name)
            .await
            .map_err(|e| Error::Bus(format!("get stream {name}: {e}")))
    }
}

/// Declaration of a durable consumer.
pub struct ConsumerSpec {
    pub stream: &'static str,
    pub name: &'static str,
    pub filter_subjects: Vec<String>,
    pub max_deliver: i64,
    pub ack_wait: Duration,
    pub deliver_policy: DeliverPolicy,
}

impl ConsumerSpec {
    pub fn durable(stream: &'static str, name: &'static str, subjects: &[&str]) -> Self {
        ConsumerSpec {
            stream,
            name,
            filter_subjects: subjects.iter().map(|s| s.to_string()).collect(),
            max_deliver: DEFAULT_MAX_DELIVER,
            ack_wait: ACK_WAIT_DEFAULT,
            deliver_policy: DeliverPolicy::All,
        }
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

/// Runs a durable consumer until shutdown. Handler failures are NAKed with
/// the backoff schedule; once `redeliveries >= max_deliver - 1` the message
/// is dead-lettered and acked instead.
pub async fn run_consumer<F, Fut>(
    bus: EventBus,
    spec: ConsumerSpec,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) -> Result<()>
where
    F: Fn(Envelope) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let stream = bus.stream(spec.stream).await?;
    let consumer = stream
        .get_or_create_consumer(
            spec.name,
            pull::Config {
                durable_name: Some(spec.name.to_string()),
                filter_subjects: spec.filter_subjects.clone(),
                max_deliver: spec.max_deliver,
                ack_wait: spec.ack_wait,
                deliver_policy: spec.deliver_policy,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| Error::Bus(format!("consumer {}: {e}", spec.name)))?;

    let mut messages = consumer
        .messages()
        .await
        .map_err(|e| Error::Bus(format!("consumer {} messages: {e}", spec.name)))?;

    tracing::info!(consumer = spec.name, stream = spec.stream, "consumer running");

    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => break,
            next = messages.next() => match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    tracing::warn!(consumer = spec.name, error = %e, "message stream error");
                    continue;
                }
                None => break,
            },
        };

        let delivered = msg.info().map(|i| i.delivered).unwrap_or(1);
        let redeliveries = delivered - 1;

        let envelope = match serde_json::from_slice::<Envelope>(&msg.payload) {
            Ok(env) => env,
            Err(e) => {
                // Poison message: ack so it never loops.
                tracing::warn!(consumer = spec.name, error = %e, "malformed envelope, dropping");
                let _ = msg.ack().await;
                continue;
            }
        };

        match handler(envelope.clone()).await {
            Ok(()) => {
                if let Err(e) = msg.ack().await {
                    tracing::warn!(consumer = spec.name, error = %e, "ack failed");
                }
            }
            Err(e) if redeliveries >= spec.max_deliver - 1 => {
                tracing::error!(
                    consumer = spec.name,
                    subject = envelope.subject(),
                    event_id = %envelope.event_id,
                    attempts = delivered,
                    error = %e,
                    "retry budget spent, dead-lettering"
                );
                let entry = DeadLetter {
                    original_subject: envelope.subject().to_string(),
                    original_event: serde_json::to_value(&envelope).unwrap_or_default(),
                    last_error: e.to_string(),
                    attempts: delivered,
                };
                if let Err(e) = bus
                    .publish_dead_letter(&entry, &envelope.event_id.to_string())
                    .await
                {
                    tracing::error!(consumer = spec.name, error = %e, "dead letter publish failed");
                }
                let _ = msg.ack().await;
            }
            Err(e) => {
                let delay = backoff_delay(delivered);
                tracing::warn!(
                    consumer = spec.name,
                    subject = envelope.subject(),
                    attempt = delivered,
                    retry_in = ?delay,
                    error = %e,
                    "handler failed, scheduling redelivery"
                );
                if let Err(e) = msg.ack_with(AckKind::Nak(Some(delay))).await {
                    tracing::warn!(consumer = spec.name, error = %e, "nak failed");
                }
            }
        }
    }

    tracing::info!(consumer = spec.name, "consumer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_the_schedule_then_clamps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(5));
        assert_eq!(backoff_delay(3), Duration::from_secs(30));
        assert_eq!(backoff_delay(4), Duration::from_secs(120));
        assert_eq!(backoff_delay(5), Duration::from_secs(300));
        assert_eq!(backoff_delay(17), Duration::from_secs(300));
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn stream_table_covers_every_subject_family() {
        let bookings = &STREAMS[0];
        assert_eq!(bookings.name, STREAM_BOOKINGS);
        assert!(bookings.subjects.contains(&"slot.held"));
        assert!(bookings.subjects.contains(&"booking.canceled"));

        let notifications = &STREAMS[2];
        assert!(matches!(notifications.retention, stream::RetentionPolicy::WorkQueue));
        assert_eq!(notifications.max_age, DAY);

        let dlq = &STREAMS[3];
        assert_eq!(dlq.subjects, ["dlq.>"].as_slice());
        assert_eq!(dlq.max_age, Duration::from_secs(90 * 24 * 60 * 60));
    }
}
