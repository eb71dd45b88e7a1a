//! Real-time gateway.
//!
//! One SSE stream per viewer of a public booking page, backed by an
//! ephemeral JetStream consumer with `deliver_policy = new`: no backlog is
//! replayed, because the client does a fresh slot listing on connect. Frames
//! carry the event type as the SSE `event` field, the event id as `id`, and
//! the envelope's `data` alone as payload.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::{stream, Stream, StreamExt};
use uuid::Uuid;

use crate::bus::{ACK_WAIT_REALTIME, STREAM_BOOKINGS};
use crate::error::{Error, Result};
use crate::events::Envelope;
use crate::state::AppState;

const REALTIME_MAX_DELIVER: i64 = 3;

pub async fn slot_stream(
    State(state): State<AppState>,
    Path(meeting_type_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    let bookings = state.bus.stream(STREAM_BOOKINGS).await?;
    let consumer = bookings
        .create_consumer(async_nats::jetstream::consumer::pull::Config {
            deliver_policy: async_nats::jetstream::consumer::DeliverPolicy::New,
            ack_wait: ACK_WAIT_REALTIME,
            max_deliver: REALTIME_MAX_DELIVER,
            // A gone client's subscription is reaped within one ack-wait
            // window.
            inactive_threshold: ACK_WAIT_REALTIME,
            ..Default::default()
        })
        .await
        .map_err(|e| Error::Bus(format!("realtime consumer: {e}")))?;
    let messages = consumer
        .messages()
        .await
        .map_err(|e| Error::Bus(format!("realtime messages: {e}")))?;

    tracing::debug!(%meeting_type_id, "realtime viewer connected");

    let connected = SseEvent::default()
        .event("connected")
        .data(serde_json::json!({ "meetingTypeId": meeting_type_id }).to_string());

    let events = messages.filter_map(move |next| async move {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "realtime message stream error");
                return None;
            }
        };
        // Ack unconditionally, malformed payloads included, so nothing can
        // poison-loop a viewer; missed frames are healed by the client's
        // next slot listing.
        if let Err(e) = msg.ack().await {
            tracing::warn!(error = %e, "realtime ack failed");
        }
        let envelope: Envelope = match serde_json::from_slice(&msg.payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "malformed realtime payload, dropping");
                return None;
            }
        };
        if envelope.event.meeting_type_id() != Some(meeting_type_id) {
            return None;
        }
        let data = serde_json::to_value(&envelope.event)
            .ok()
            .and_then(|v| v.get("data").cloned())?;
        Some(Ok(SseEvent::default()
            .id(envelope.event_id.to_string())
            .event(envelope.subject())
            .data(data.to_string())))
    });

    let frames = stream::once(async move { Ok::<_, Infallible>(connected) }).chain(events);
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}
