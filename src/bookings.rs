//! Booking confirmer.
//!
//! Converts a valid hold into a durable booking in a single transaction:
//! idempotent replay by key, hold validation (expiring it in-line when the
//! TTL has lapsed), NDA gating, insert guarded by the bookings exclusion
//! constraint, hold conversion, document linking. Events go out only after
//! commit.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::availability::parse_zone;
use crate::error::{Error, Result};
use crate::events::{BookingChanged, Envelope, Event, ReleaseReason, SlotReleased};
use crate::models::{Booking, BookingStatus, Document, DocumentStatus, HoldStatus, MeetingType, SlotHold};
use crate::state::AppState;

pub struct ConfirmRequest {
    pub hold_id: Uuid,
    pub guest_name: String,
    pub guest_timezone: String,
    pub guest_notes: Option<String>,
    pub idempotency_key: Uuid,
}

pub async fn confirm_booking(
    state: &AppState,
    meeting_type: &MeetingType,
    req: ConfirmRequest,
) -> Result<Booking> {
    // Idempotent replay short-circuit.
    if let Some(existing) = booking_by_key(&state.db, req.idempotency_key).await? {
        return Ok(existing);
    }

    let now = Utc::now();
    let mut tx = state.db.begin().await?;

    let hold = sqlx::query_as::<_, SlotHold>(
        "SELECT * FROM slot_holds WHERE id = $1 AND meeting_type_id = $2 FOR UPDATE",
    )
    .bind(req.hold_id)
    .bind(meeting_type.id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(Error::NotFound("hold"))?;

    match hold.status {
        HoldStatus::Active => {}
        HoldStatus::Expired => return Err(Error::HoldExpired),
        HoldStatus::Released | HoldStatus::Converted => {
            return Err(Error::Validation("Hold is no longer active".into()))
        }
    }
    if hold.expires_at < now {
        // Lapsed but not yet swept: expire it here so the slot frees up
        // without waiting for the sweeper.
        sqlx::query("UPDATE slot_holds SET status = 'expired' WHERE id = $1 AND status = 'active'")
            .bind(hold.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        emit_released(state, &hold, ReleaseReason::Expired).await;
        return Err(Error::HoldExpired);
    }

    let document = if meeting_type.requires_nda {
        let doc = sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE hold_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(hold.id)
        .fetch_optional(&mut *tx)
        .await?;
        match doc {
            Some(d) if d.status == DocumentStatus::Signed => Some(d),
            _ => return Err(Error::NdaRequired),
        }
    } else {
        None
    };

    let booking = sqlx::query_as::<_, Booking>(
        "INSERT INTO bookings
           (id, meeting_type_id, host_id, slot_start, slot_end, guest_email,
            guest_name, guest_timezone, guest_notes, status, idempotency_key, from_hold_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'confirmed', $10, $11)
         RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(meeting_type.id)
    .bind(meeting_type.owner_id)
    .bind(hold.slot_start)
    .bind(hold.slot_end)
    .bind(&hold.guest_email)
    .bind(&req.guest_name)
    .bind(&req.guest_timezone)
    .bind(&req.guest_notes)
    .bind(req.idempotency_key)
    .bind(hold.id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23P01") => {
            Error::SlotUnavailable("Slot already booked")
        }
        other => other.into(),
    })?;

    // Single-shot conversion, inside the same transaction.
    sqlx::query("UPDATE slot_holds SET status = 'converted' WHERE id = $1 AND status = 'active'")
        .bind(hold.id)
        .execute(&mut *tx)
        .await?;

    if let Some(doc) = &document {
        sqlx::query("UPDATE documents SET booking_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(doc.id)
            .bind(booking.id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    state
        .bus
        .publish_logged(&Envelope::new(Event::BookingConfirmed(BookingChanged {
            booking_id: booking.id,
            meeting_type_id: booking.meeting_type_id,
            host_id: booking.host_id,
            slot_start: booking.slot_start,
            slot_end: booking.slot_end,
            guest_email: booking.guest_email.clone(),
            guest_name: booking.guest_name.clone(),
        })))
        .await;
    emit_released(state, &hold, ReleaseReason::Converted).await;

    Ok(booking)
}

/// Guest-side cancellation via the capability URL from the confirmation
/// email. Monotonic: a canceled booking never returns to confirmed.
pub async fn cancel_booking(
    state: &AppState,
    meeting_type: &MeetingType,
    booking_id: Uuid,
) -> Result<Booking> {
    let canceled = sqlx::query_as::<_, Booking>(
        "UPDATE bookings SET status = 'canceled', updated_at = NOW()
         WHERE id = $1 AND meeting_type_id = $2 AND status = 'confirmed'
         RETURNING *",
    )
    .bind(booking_id)
    .bind(meeting_type.id)
    .fetch_optional(&state.db)
    .await?;

    match canceled {
        Some(booking) => {
            state
                .bus
                .publish_logged(&Envelope::new(Event::BookingCanceled(BookingChanged {
                    booking_id: booking.id,
                    meeting_type_id: booking.meeting_type_id,
                    host_id: booking.host_id,
                    slot_start: booking.slot_start,
                    slot_end: booking.slot_end,
                    guest_email: booking.guest_email.clone(),
                    guest_name: booking.guest_name.clone(),
                })))
                .await;
            Ok(booking)
        }
        None => {
            let exists: Option<Booking> = sqlx::query_as(
                "SELECT * FROM bookings WHERE id = $1 AND meeting_type_id = $2",
            )
            .bind(booking_id)
            .bind(meeting_type.id)
            .fetch_optional(&state.db)
            .await?;
            match exists {
                Some(b) if b.status == BookingStatus::Canceled => Ok(b),
                Some(_) => Err(Error::Validation("Booking can no longer be canceled".into())),
                None => Err(Error::NotFound("booking")),
            }
        }
    }
}

async fn booking_by_key(db: &sqlx::PgPool, key: Uuid) -> Result<Option<Booking>> {
    let booking = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE idempotency_key = $1")
        .bind(key)
        .fetch_optional(db)
        .await?;
    Ok(booking)
}

async fn emit_released(state: &AppState, hold: &SlotHold, reason: ReleaseReason) {
    state
        .bus
        .publish_logged(&Envelope::new(Event::SlotReleased(SlotReleased {
            hold_id: hold.id,
            meeting_type_id: hold.meeting_type_id,
            slot_start: hold.slot_start,
            slot_end: hold.slot_end,
            reason,
        })))
        .await;
}

// --- HTTP ---

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBookingRequest {
    pub hold_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub guest_name: String,
    pub guest_timezone: String,
    #[validate(length(max = 2000))]
    pub guest_notes: Option<String>,
    pub idempotency_key: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    pub id: Uuid,
    pub meeting_type_id: Uuid,
    pub slot_start: chrono::DateTime<Utc>,
    pub slot_end: chrono::DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: String,
    pub guest_timezone: String,
    pub status: BookingStatus,
}

impl From<Booking> for BookingView {
    fn from(b: Booking) -> Self {
        BookingView {
            id: b.id,
            meeting_type_id: b.meeting_type_id,
            slot_start: b.slot_start,
            slot_end: b.slot_end,
            guest_email: b.guest_email,
            guest_name: b.guest_name,
            guest_timezone: b.guest_timezone,
            status: b.status,
        }
    }
}

pub async fn confirm_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<ConfirmBookingRequest>,
) -> Result<Json<serde_json::Value>> {
    req.validate()?;
    parse_zone(&req.guest_timezone)?;
    let meeting_type = MeetingType::active_by_slug(&state.db, &slug)
        .await?
        .ok_or(Error::NotFound("meeting type"))?;

    let booking = confirm_booking(
        &state,
        &meeting_type,
        ConfirmRequest {
            hold_id: req.hold_id,
            guest_name: req.guest_name,
            guest_timezone: req.guest_timezone,
            guest_notes: req.guest_notes,
            idempotency_key: req.idempotency_key,
        },
    )
    .await
    // Confirmation reports conflicts as 400: the hold is stale, retrying
    // the identical request cannot help.
    .map_err(Error::conflict_as_bad_request)?;

    Ok(Json(serde_json::json!({ "booking": BookingView::from(booking) })))
}

pub async fn cancel_handler(
    State(state): State<AppState>,
    Path((slug, booking_id)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>> {
    let meeting_type = MeetingType::active_by_slug(&state.db, &slug)
        .await?
        .ok_or(Error::NotFound("meeting type"))?;
    let booking = cancel_booking(&state, &meeting_type, booking_id).await?;
    Ok(Json(serde_json::json!({
        "bookingId": booking.id,
        "status": booking.status,
    })))
}
