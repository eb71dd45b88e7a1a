//! Hold manager.
//!
//! Issues short-lived exclusive reservations of a slot. Double-booking is
//! prevented by three cooperating layers: the idempotency-key short-circuit,
//! a transaction-scoped advisory lock keyed by (meeting_type, slot_start)
//! that linearizes attempts at the identical slot, and the btree_gist
//! exclusion constraint on `slot_holds`, which is the authoritative net for
//! distinct-but-overlapping ranges.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;
use validator::Validate;

use crate::error::{Error, Result};
use crate::events::{Event, NdaChanged, ReleaseReason, SlotHeld, SlotReleased};
use crate::models::{Document, HoldStatus, MeetingType, SlotHold};
use crate::state::AppState;

pub const HOLD_TTL_MINUTES: i64 = 15;

pub fn hold_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(HOLD_TTL_MINUTES)
}

/// Stable 64-bit key for `pg_advisory_xact_lock`, derived from the meeting
/// type and the slot start. Must agree across processes, so no process-seeded
/// hasher.
pub fn slot_lock_key(meeting_type_id: Uuid, slot_start: DateTime<Utc>) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(meeting_type_id.as_bytes());
    hasher.update(slot_start.timestamp().to_be_bytes());
    let digest = hasher.finalize();
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

async fn acquire_slot_lock(
    tx: &mut Transaction<'_, Postgres>,
    meeting_type_id: Uuid,
    slot_start: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(slot_lock_key(meeting_type_id, slot_start))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn is_exclusion_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23P01"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

pub struct NewHold {
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: Option<String>,
    pub idempotency_key: Uuid,
}

pub struct CreatedHold {
    pub hold: SlotHold,
    pub document: Option<Document>,
    /// False on idempotent replay.
    pub created: bool,
}

/// Creates a hold, or replays the one already created under the same
/// idempotency key. Exactly one of two racing clients for the identical slot
/// succeeds; the loser gets `SlotUnavailable` and no row.
pub async fn create_hold(
    state: &AppState,
    meeting_type: &MeetingType,
    new: NewHold,
) -> Result<CreatedHold> {
    if new.slot_start >= new.slot_end {
        return Err(Error::Validation("slotEnd must follow slotStart".into()));
    }
    let minutes = (new.slot_end - new.slot_start).num_minutes();
    if minutes != meeting_type.duration_minutes as i64 {
        return Err(Error::Validation(format!(
            "slot length {minutes}m does not match the {}m meeting type",
            meeting_type.duration_minutes
        )));
    }
    let now = Utc::now();
    if new.slot_start <= now {
        return Err(Error::Validation("slot is in the past".into()));
    }

    let mut tx = state.db.begin().await?;
    acquire_slot_lock(&mut tx, meeting_type.id, new.slot_start).await?;

    // Layer 1: idempotency short-circuit, checked under the lock so a
    // replayed request racing its original sees the committed row.
    if let Some(prior) = sqlx::query_as::<_, SlotHold>(
        "SELECT * FROM slot_holds WHERE idempotency_key = $1",
    )
    .bind(new.idempotency_key)
    .fetch_optional(&mut *tx)
    .await?
    {
        tx.rollback().await?;
        if prior.status == HoldStatus::Active && prior.expires_at > now {
            let document = document_for_hold(&state.db, prior.id).await?;
            return Ok(CreatedHold { hold: prior, document, created: false });
        }
        return Err(Error::PreviousHoldDead);
    }

    // Layer 2: explicit re-query under the serialization lock.
    let (held, booked): (bool, bool) = sqlx::query_as(
        "SELECT
           EXISTS(SELECT 1 FROM slot_holds
                   WHERE meeting_type_id = $1 AND status = 'active'
                     AND slot_start < $3 AND slot_end > $2),
           EXISTS(SELECT 1 FROM bookings
                   WHERE meeting_type_id = $1 AND status = 'confirmed'
                     AND slot_start < $3 AND slot_end > $2)",
    )
    .bind(meeting_type.id)
    .bind(new.slot_start)
    .bind(new.slot_end)
    .fetch_one(&mut *tx)
    .await?;
    if held {
        return Err(Error::SlotUnavailable("Slot already held"));
    }
    if booked {
        return Err(Error::SlotUnavailable("Slot already booked"));
    }

    // Layer 3: the insert itself, with the exclusion constraint as the
    // authoritative guard.
    let expires_at = hold_expiry(now);
    let hold = sqlx::query_as::<_, SlotHold>(
        "INSERT INTO slot_holds
           (id, meeting_type_id, slot_start, slot_end, guest_email, guest_name,
            status, expires_at, idempotency_key)
         VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8)
         RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(meeting_type.id)
    .bind(new.slot_start)
    .bind(new.slot_end)
    .bind(&new.guest_email)
    .bind(&new.guest_name)
    .bind(expires_at)
    .bind(new.idempotency_key)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if is_exclusion_violation(&e) || is_unique_violation(&e) {
            Error::SlotUnavailable("Slot already held")
        } else {
            e.into()
        }
    })?;

    let document = if meeting_type.requires_nda {
        Some(
            sqlx::query_as::<_, Document>(
                "INSERT INTO documents (id, hold_id, signer_email, signer_name, status)
                 VALUES ($1, $2, $3, $4, 'pending')
                 RETURNING *",
            )
            .bind(Uuid::now_v7())
            .bind(hold.id)
            .bind(&new.guest_email)
            .bind(&new.guest_name)
            .fetch_one(&mut *tx)
            .await?,
        )
    } else {
        None
    };

    tx.commit().await?;

    // Emission strictly after commit: subscribers never observe a hold that
    // queries cannot see yet.
    state
        .bus
        .publish_logged(&crate::events::Envelope::new(Event::SlotHeld(SlotHeld {
            hold_id: hold.id,
            meeting_type_id: hold.meeting_type_id,
            slot_start: hold.slot_start,
            slot_end: hold.slot_end,
            expires_at: hold.expires_at,
        })))
        .await;

    if let Some(doc) = &document {
        state
            .bus
            .publish_logged(&crate::events::Envelope::new(Event::NdaCreated(NdaChanged {
                document_id: doc.id,
                hold_id: hold.id,
                signer_email: doc.signer_email.clone(),
                external_envelope_id: None,
            })))
            .await;
        dispatch_envelope(state, doc.clone());
    }

    Ok(CreatedHold { hold, document, created: true })
}

/// Asks the e-signature provider for an envelope in the background; without
/// provider credentials this is a logged no-op and the document stays
/// pending.
fn dispatch_envelope(state: &AppState, document: Document) {
    let Some(client) = state.signwell.clone() else {
        tracing::warn!(document_id = %document.id, "no e-signature credentials, NDA envelope not sent");
        return;
    };
    let db = state.db.clone();
    tokio::spawn(async move {
        match client.create_envelope(&document).await {
            Ok(envelope_id) => {
                if let Err(e) = sqlx::query(
                    "UPDATE documents SET external_envelope_id = $2, updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(document.id)
                .bind(&envelope_id)
                .execute(&db)
                .await
                {
                    tracing::error!(document_id = %document.id, error = %e, "failed to record envelope id");
                }
            }
            Err(e) => {
                tracing::error!(document_id = %document.id, error = %e, "envelope creation failed");
            }
        }
    });
}

pub async fn document_for_hold(db: &PgPool, hold_id: Uuid) -> Result<Option<Document>> {
    let doc = sqlx::query_as::<_, Document>(
        "SELECT * FROM documents WHERE hold_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(hold_id)
    .fetch_optional(db)
    .await?;
    Ok(doc)
}

/// Releases an active hold on the guest's behalf. Terminal and single-shot;
/// the released slot is announced on the bus.
pub async fn release_hold(state: &AppState, meeting_type: &MeetingType, hold_id: Uuid) -> Result<SlotHold> {
    let released = sqlx::query_as::<_, SlotHold>(
        "UPDATE slot_holds SET status = 'released'
         WHERE id = $1 AND meeting_type_id = $2 AND status = 'active'
         RETURNING *",
    )
    .bind(hold_id)
    .bind(meeting_type.id)
    .fetch_optional(&state.db)
    .await?;

    match released {
        Some(hold) => {
            state
                .bus
                .publish_logged(&crate::events::Envelope::new(Event::SlotReleased(SlotReleased {
                    hold_id: hold.id,
                    meeting_type_id: hold.meeting_type_id,
                    slot_start: hold.slot_start,
                    slot_end: hold.slot_end,
                    reason: ReleaseReason::Canceled,
                })))
                .await;
            Ok(hold)
        }
        None => {
            let exists = sqlx::query_as::<_, SlotHold>(
                "SELECT * FROM slot_holds WHERE id = $1 AND meeting_type_id = $2",
            )
            .bind(hold_id)
            .bind(meeting_type.id)
            .fetch_optional(&state.db)
            .await?;
            match exists {
                Some(_) => Err(Error::Validation("Hold is not active".into())),
                None => Err(Error::NotFound("hold")),
            }
        }
    }
}

// --- HTTP ---

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateHoldRequest {
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 200))]
    pub name: Option<String>,
    pub idempotency_key: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldResponse {
    pub hold_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub nda_required: bool,
}

pub async fn create_hold_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<CreateHoldRequest>,
) -> Result<(StatusCode, Json<HoldResponse>)> {
    req.validate()?;
    let meeting_type = MeetingType::active_by_slug(&state.db, &slug)
        .await?
        .ok_or(Error::NotFound("meeting type"))?;

    let created = create_hold(
        &state,
        &meeting_type,
        NewHold {
            slot_start: req.slot_start,
            slot_end: req.slot_end,
            guest_email: req.email,
            guest_name: req.name,
            idempotency_key: req.idempotency_key,
        },
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(HoldResponse {
            hold_id: created.hold.id,
            expires_at: created.hold.expires_at,
            nda_required: meeting_type.requires_nda,
        }),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldStatusResponse {
    pub hold_id: Uuid,
    pub status: HoldStatus,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub nda_required: bool,
    pub nda_signed: bool,
}

pub async fn get_hold_handler(
    State(state): State<AppState>,
    Path((slug, hold_id)): Path<(String, Uuid)>,
) -> Result<Json<HoldStatusResponse>> {
    let meeting_type = MeetingType::active_by_slug(&state.db, &slug)
        .await?
        .ok_or(Error::NotFound("meeting type"))?;
    let hold = sqlx::query_as::<_, SlotHold>(
        "SELECT * FROM slot_holds WHERE id = $1 AND meeting_type_id = $2",
    )
    .bind(hold_id)
    .bind(meeting_type.id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(Error::NotFound("hold"))?;

    let document = document_for_hold(&state.db, hold.id).await?;
    Ok(Json(HoldStatusResponse {
        hold_id: hold.id,
        status: hold.status,
        slot_start: hold.slot_start,
        slot_end: hold.slot_end,
        expires_at: hold.expires_at,
        nda_required: meeting_type.requires_nda,
        nda_signed: document
            .map(|d| d.status == crate::models::DocumentStatus::Signed)
            .unwrap_or(false),
    }))
}

pub async fn release_hold_handler(
    State(state): State<AppState>,
    Path((slug, hold_id)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>> {
    let meeting_type = MeetingType::active_by_slug(&state.db, &slug)
        .await?
        .ok_or(Error::NotFound("meeting type"))?;
    let hold = release_hold(&state, &meeting_type, hold_id).await?;
    Ok(Json(serde_json::json!({ "holdId": hold.id, "status": hold.status })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lock_key_is_stable_across_calls() {
        let mt = Uuid::parse_str("0190f3a2-2f5e-7c1d-9b8a-111111111111").unwrap();
        let start = Utc.with_ymd_and_hms(2025, 4, 8, 13, 0, 0).unwrap();
        assert_eq!(slot_lock_key(mt, start), slot_lock_key(mt, start));
    }

    #[test]
    fn lock_key_separates_slots_and_meeting_types() {
        let mt_a = Uuid::new_v4();
        let mt_b = Uuid::new_v4();
        let start = Utc.with_ymd_and_hms(2025, 4, 8, 13, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 4, 8, 13, 30, 0).unwrap();
        assert_ne!(slot_lock_key(mt_a, start), slot_lock_key(mt_b, start));
        assert_ne!(slot_lock_key(mt_a, start), slot_lock_key(mt_a, later));
    }

    #[test]
    fn hold_expiry_is_fifteen_minutes_to_the_second() {
        let now = Utc.with_ymd_and_hms(2025, 4, 8, 12, 0, 0).unwrap();
        assert_eq!(hold_expiry(now), Utc.with_ymd_and_hms(2025, 4, 8, 12, 15, 0).unwrap());
    }
}
