//! Event envelope and wire payloads for the bus.
//!
//! Every published message is an [`Envelope`]: `{event_id, event_type,
//! occurred_at, data}`. The `event_type` string doubles as the NATS subject
//! and as the serde discriminator, so unknown or malformed payloads fail at
//! the edge instead of inside a handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SUBJECT_SLOT_HELD: &str = "slot.held";
pub const SUBJECT_SLOT_RELEASED: &str = "slot.released";
pub const SUBJECT_BOOKING_CONFIRMED: &str = "booking.confirmed";
pub const SUBJECT_BOOKING_CANCELED: &str = "booking.canceled";
pub const SUBJECT_NDA_CREATED: &str = "nda.created";
pub const SUBJECT_NDA_SENT: &str = "nda.sent";
pub const SUBJECT_NDA_SIGNED: &str = "nda.signed";
pub const SUBJECT_NDA_EXPIRED: &str = "nda.expired";
pub const SUBJECT_EMAIL_REQUESTED: &str = "notify.email.requested";
pub const SUBJECT_EMAIL_SENT: &str = "notify.email.sent";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    pub fn new(event: Event) -> Self {
        Envelope {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn subject(&self) -> &'static str {
        self.event.subject()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum Event {
    #[serde(rename = "slot.held")]
    SlotHeld(SlotHeld),
    #[serde(rename = "slot.released")]
    SlotReleased(SlotReleased),
    #[serde(rename = "booking.confirmed")]
    BookingConfirmed(BookingChanged),
    #[serde(rename = "booking.canceled")]
    BookingCanceled(BookingChanged),
    #[serde(rename = "nda.created")]
    NdaCreated(NdaChanged),
    #[serde(rename = "nda.sent")]
    NdaSent(NdaChanged),
    #[serde(rename = "nda.signed")]
    NdaSigned(NdaChanged),
    #[serde(rename = "nda.expired")]
    NdaExpired(NdaChanged),
    #[serde(rename = "notify.email.requested")]
    EmailRequested(EmailNotification),
    #[serde(rename = "notify.email.sent")]
    EmailSent(EmailNotification),
}

impl Event {
    pub fn subject(&self) -> &'static str {
        match self {
            Event::SlotHeld(_) => SUBJECT_SLOT_HELD,
            Event::SlotReleased(_) => SUBJECT_SLOT_RELEASED,
            Event::BookingConfirmed(_) => SUBJECT_BOOKING_CONFIRMED,
            Event::BookingCanceled(_) => SUBJECT_BOOKING_CANCELED,
            Event::NdaCreated(_) => SUBJECT_NDA_CREATED,
            Event::NdaSent(_) => SUBJECT_NDA_SENT,
            Event::NdaSigned(_) => SUBJECT_NDA_SIGNED,
            Event::NdaExpired(_) => SUBJECT_NDA_EXPIRED,
            Event::EmailRequested(_) => SUBJECT_EMAIL_REQUESTED,
            Event::EmailSent(_) => SUBJECT_EMAIL_SENT,
        }
    }

    /// Meeting type the event belongs to, where it has one. The real-time
    /// gateway fans out on this.
    pub fn meeting_type_id(&self) -> Option<Uuid> {
        match self {
            Event::SlotHeld(e) => Some(e.meeting_type_id),
            Event::SlotReleased(e) => Some(e.meeting_type_id),
            Event::BookingConfirmed(e) | Event::BookingCanceled(e) => Some(e.meeting_type_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotHeld {
    pub hold_id: Uuid,
    pub meeting_type_id: Uuid,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    Canceled,
    Converted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotReleased {
    pub hold_id: Uuid,
    pub meeting_type_id: Uuid,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub reason: ReleaseReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingChanged {
    pub booking_id: Uuid,
    pub meeting_type_id: Uuid,
    pub host_id: Uuid,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub guest_email: String,
    pub guest_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdaChanged {
    pub document_id: Uuid,
    pub hold_id: Uuid,
    pub signer_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_envelope_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailNotification {
    pub booking_id: Uuid,
    pub recipient: String,
    pub kind: EmailKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    BookingConfirmation,
    BookingCanceled,
}

/// Entry published on `dlq.<subject>` once a message exhausts its retry
/// budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_subject: String,
    pub original_event: serde_json::Value,
    pub last_error: String,
    pub attempts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_subject_discriminator() {
        let env = Envelope::new(Event::SlotHeld(SlotHeld {
            hold_id: Uuid::new_v4(),
            meeting_type_id: Uuid::new_v4(),
            slot_start: Utc::now(),
            slot_end: Utc::now(),
            expires_at: Utc::now(),
        }));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["event_type"], "slot.held");
        assert!(json["data"]["meeting_type_id"].is_string());

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_id, env.event_id);
        assert_eq!(back.subject(), SUBJECT_SLOT_HELD);
    }

    #[test]
    fn unknown_event_type_is_rejected_at_the_edge() {
        let raw = serde_json::json!({
            "event_id": Uuid::new_v4(),
            "occurred_at": Utc::now(),
            "event_type": "slot.mangled",
            "data": {}
        });
        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }

    #[test]
    fn release_reason_serializes_snake_case() {
        let v = serde_json::to_value(ReleaseReason::Expired).unwrap();
        assert_eq!(v, "expired");
    }

    #[test]
    fn fan_out_key_present_only_for_slot_and_booking_events() {
        let mt = Uuid::new_v4();
        let slot = Event::SlotReleased(SlotReleased {
            hold_id: Uuid::new_v4(),
            meeting_type_id: mt,
            slot_start: Utc::now(),
            slot_end: Utc::now(),
            reason: ReleaseReason::Converted,
        });
        assert_eq!(slot.meeting_type_id(), Some(mt));

        let nda = Event::NdaSigned(NdaChanged {
            document_id: Uuid::new_v4(),
            hold_id: Uuid::new_v4(),
            signer_email: "g@example.com".into(),
            external_envelope_id: None,
        });
        assert_eq!(nda.meeting_type_id(), None);
    }
}
