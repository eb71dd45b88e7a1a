//! Storage row types.
//!
//! All timestamps are UTC instants; wall-times only ever appear paired with
//! the owner's IANA zone. Status enums mirror the Postgres enum types in the
//! migrations.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MeetingType {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub duration_minutes: i32,
    pub buffer_before_minutes: i32,
    pub buffer_after_minutes: i32,
    pub location: Option<String>,
    pub requires_nda: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AvailabilityRule {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub meeting_type_id: Option<Uuid>,
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: i32,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub effective_from: NaiveDate,
    pub effective_until: Option<NaiveDate>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlackoutDate {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub reason: Option<String>,
    pub recurring_yearly: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "hold_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Active,
    Converted,
    Expired,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SlotHold {
    pub id: Uuid,
    pub meeting_type_id: Uuid,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: Option<String>,
    pub status: HoldStatus,
    pub expires_at: DateTime<Utc>,
    pub idempotency_key: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "booking_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Canceled,
    Completed,
    NoShow,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: Uuid,
    pub meeting_type_id: Uuid,
    pub host_id: Uuid,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: String,
    pub guest_timezone: String,
    pub guest_notes: Option<String>,
    pub status: BookingStatus,
    pub idempotency_key: Uuid,
    pub from_hold_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "document_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Sent,
    Signed,
    Expired,
    Revoked,
}

impl DocumentStatus {
    /// The document state machine only moves forward:
    /// pending -> sent -> signed, with expired/revoked as side exits.
    pub fn can_advance_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Signed) | (Sent, Signed)
                | (Pending, Expired) | (Sent, Expired)
                | (Pending, Revoked) | (Sent, Revoked)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Document {
    pub id: Uuid,
    pub hold_id: Uuid,
    pub booking_id: Option<Uuid>,
    pub status: DocumentStatus,
    pub signer_email: String,
    pub signer_name: Option<String>,
    pub external_envelope_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub signed_at: Option<DateTime<Utc>>,
    pub audit: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "webhook_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedWebhook {
    pub id: Uuid,
    pub provider: String,
    pub webhook_id: String,
    pub status: WebhookStatus,
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub async fn by_id(db: &sqlx::PgPool, id: Uuid) -> crate::error::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(user)
    }
}

impl MeetingType {
    pub async fn active_by_slug(
        db: &sqlx::PgPool,
        slug: &str,
    ) -> crate::error::Result<Option<MeetingType>> {
        let mt = sqlx::query_as::<_, MeetingType>(
            "SELECT * FROM meeting_types WHERE slug = $1 AND active = TRUE",
        )
        .bind(slug)
        .fetch_optional(db)
        .await?;
        Ok(mt)
    }

    pub async fn by_id(db: &sqlx::PgPool, id: Uuid) -> crate::error::Result<Option<MeetingType>> {
        let mt = sqlx::query_as::<_, MeetingType>("SELECT * FROM meeting_types WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(mt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_transitions_are_forward_only() {
        use DocumentStatus::*;
        assert!(Pending.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Signed));
        assert!(Pending.can_advance_to(Signed));
        assert!(!Signed.can_advance_to(Sent));
        assert!(!Signed.can_advance_to(Expired));
        assert!(!Expired.can_advance_to(Signed));
        assert!(!Revoked.can_advance_to(Signed));
    }
}
