//! Webhook reactor for the e-signature provider.
//!
//! Ingests provider callbacks idempotently on `(provider, webhook_id)`,
//! where the webhook id is derived as `"{document_id}:{event_name}"`.
//! Signature verification is constant-time HMAC-SHA-256 over the raw body
//! and mandatory whenever a shared secret is configured.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{Envelope, Event, NdaChanged};
use crate::models::{Document, DocumentStatus, ProcessedWebhook, WebhookStatus};
use crate::state::AppState;

pub const PROVIDER: &str = "signwell";
pub const SIGNATURE_HEADER: &str = "x-signwell-signature";

pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

pub fn derive_webhook_id(document_id: &str, event_name: &str) -> String {
    format!("{document_id}:{event_name}")
}

#[derive(Debug, Deserialize)]
pub struct SignwellWebhook {
    pub event: SignwellEvent,
    pub data: SignwellData,
}

#[derive(Debug, Deserialize)]
pub struct SignwellEvent {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct SignwellData {
    pub object: SignwellDocument,
}

#[derive(Debug, Deserialize)]
pub struct SignwellDocument {
    pub id: String,
    #[serde(default)]
    pub custom_fields: Vec<SignwellCustomField>,
}

#[derive(Debug, Deserialize)]
pub struct SignwellCustomField {
    pub api_id: String,
    pub value: serde_json::Value,
}

impl SignwellDocument {
    pub fn hold_id(&self) -> Result<Uuid> {
        self.custom_fields
            .iter()
            .find(|f| f.api_id == "hold_id")
            .and_then(|f| f.value.as_str())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| Error::Validation("payload carries no hold_id custom field".into()))
    }
}

pub async fn signwell_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    match &state.config.webhook_shared_secret {
        Some(secret) => {
            let signature = headers
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok())
                .ok_or(Error::WebhookAuth)?;
            if !verify_signature(secret, &body, signature) {
                return Err(Error::WebhookAuth);
            }
        }
        // Config loading rejects this combination outside development.
        None => tracing::debug!("webhook signature verification skipped (no secret configured)"),
    }

    let webhook: SignwellWebhook = serde_json::from_slice(&body)
        .map_err(|e| Error::Validation(format!("malformed webhook payload: {e}")))?;
    let webhook_id = derive_webhook_id(&webhook.data.object.id, &webhook.event.kind);

    // Claim the (provider, webhook_id) pair; a completed prior run replays
    // its cached response and changes nothing.
    let claimed = sqlx::query_as::<_, ProcessedWebhook>(
        "INSERT INTO processed_webhooks (id, provider, webhook_id, status)
         VALUES ($1, $2, $3, 'processing')
         ON CONFLICT (provider, webhook_id) DO NOTHING
         RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(PROVIDER)
    .bind(&webhook_id)
    .fetch_optional(&state.db)
    .await?;

    if claimed.is_none() {
        let existing = sqlx::query_as::<_, ProcessedWebhook>(
            "SELECT * FROM processed_webhooks WHERE provider = $1 AND webhook_id = $2",
        )
        .bind(PROVIDER)
        .bind(&webhook_id)
        .fetch_one(&state.db)
        .await?;
        if existing.status == WebhookStatus::Completed {
            tracing::info!(webhook_id, "replaying completed webhook");
            return Ok(Json(existing.response.unwrap_or_else(|| {
                serde_json::json!({ "received": true })
            })));
        }
        // processing or failed: the provider retried, run the handler again.
    }

    let raw: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    match handle_event(&state, &webhook, &raw).await {
        Ok(response) => {
            sqlx::query(
                "UPDATE processed_webhooks SET status = 'completed', response = $3, updated_at = NOW()
                 WHERE provider = $1 AND webhook_id = $2",
            )
            .bind(PROVIDER)
            .bind(&webhook_id)
            .bind(&response)
            .execute(&state.db)
            .await?;
            Ok(Json(response))
        }
        Err(e) => {
            sqlx::query(
                "UPDATE processed_webhooks SET status = 'failed', updated_at = NOW()
                 WHERE provider = $1 AND webhook_id = $2",
            )
            .bind(PROVIDER)
            .bind(&webhook_id)
            .execute(&state.db)
            .await?;
            Err(e)
        }
    }
}

async fn handle_event(
    state: &AppState,
    webhook: &SignwellWebhook,
    raw: &serde_json::Value,
) -> Result<serde_json::Value> {
    let (target, event): (DocumentStatus, Option<fn(NdaChanged) -> Event>) =
        match webhook.event.kind.as_str() {
            "document_sent" => (DocumentStatus::Sent, Some(Event::NdaSent)),
            "document_completed" => (DocumentStatus::Signed, Some(Event::NdaSigned)),
            "document_expired" => (DocumentStatus::Expired, Some(Event::NdaExpired)),
            "document_declined" => (DocumentStatus::Revoked, None),
            other => {
                tracing::debug!(event = other, "ignoring unhandled webhook event");
                return Ok(serde_json::json!({ "received": true, "ignored": other }));
            }
        };

    let hold_id = webhook.data.object.hold_id()?;
    let transitioned =
        advance_document(state, hold_id, &webhook.data.object.id, target, raw).await?;

    if let Some(doc) = &transitioned {
        if let Some(make_event) = event {
            state
                .bus
                .publish(&Envelope::new(make_event(NdaChanged {
                    document_id: doc.id,
                    hold_id: doc.hold_id,
                    signer_email: doc.signer_email.clone(),
                    external_envelope_id: doc.external_envelope_id.clone(),
                })))
                .await?;
        }
    }

    Ok(serde_json::json!({
        "received": true,
        "documentId": webhook.data.object.id,
        "status": target,
    }))
}

/// Moves the hold's document forward to `target` if the transition is legal,
/// returning the updated row. A document already at or past `target` is left
/// alone (idempotent replay produces no second transition and no event).
async fn advance_document(
    state: &AppState,
    hold_id: Uuid,
    envelope_id: &str,
    target: DocumentStatus,
    audit: &serde_json::Value,
) -> Result<Option<Document>> {
    let sql = match target {
        DocumentStatus::Sent => {
            "UPDATE documents
                SET status = 'sent', sent_at = NOW(),
                    external_envelope_id = COALESCE(external_envelope_id, $2),
                    audit = $3, updated_at = NOW()
              WHERE hold_id = $1 AND status = 'pending'
              RETURNING *"
        }
        DocumentStatus::Signed => {
            "UPDATE documents
                SET status = 'signed', signed_at = NOW(),
                    external_envelope_id = COALESCE(external_envelope_id, $2),
                    audit = $3, updated_at = NOW()
              WHERE hold_id = $1 AND status IN ('pending', 'sent')
              RETURNING *"
        }
        DocumentStatus::Expired => {
            "UPDATE documents
                SET status = 'expired',
                    external_envelope_id = COALESCE(external_envelope_id, $2),
                    audit = $3, updated_at = NOW()
              WHERE hold_id = $1 AND status IN ('pending', 'sent')
              RETURNING *"
        }
        DocumentStatus::Revoked => {
            "UPDATE documents
                SET status = 'revoked',
                    external_envelope_id = COALESCE(external_envelope_id, $2),
                    audit = $3, updated_at = NOW()
              WHERE hold_id = $1 AND status IN ('pending', 'sent')
              RETURNING *"
        }
        DocumentStatus::Pending => return Ok(None),
    };

    let updated = sqlx::query_as::<_, Document>(sql)
        .bind(hold_id)
        .bind(envelope_id)
        .bind(audit)
        .fetch_optional(&state.db)
        .await?;

    if updated.is_none() {
        let current = sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE hold_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(hold_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(Error::NotFound("document"))?;
        tracing::info!(
            document_id = %current.id,
            current = ?current.status,
            requested = ?target,
            "document transition skipped"
        );
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_round_trip_verifies() {
        let body = br#"{"event":{"type":"document_completed"}}"#;
        let sig = sign("s3cret", body);
        assert!(verify_signature("s3cret", body, &sig));
    }

    #[test]
    fn bad_signatures_are_rejected() {
        let body = b"payload";
        let sig = sign("s3cret", body);
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("s3cret", b"tampered", &sig));
        assert!(!verify_signature("s3cret", body, "not-hex"));
        assert!(!verify_signature("s3cret", body, ""));
    }

    #[test]
    fn webhook_id_derivation_matches_reference() {
        assert_eq!(
            derive_webhook_id("doc_123", "document_completed"),
            "doc_123:document_completed"
        );
    }

    #[test]
    fn payload_parses_and_exposes_hold_id() {
        let hold_id = Uuid::new_v4();
        let raw = serde_json::json!({
            "event": { "type": "document_completed", "time": 1712500000 },
            "data": { "object": {
                "id": "env_42",
                "custom_fields": [
                    { "api_id": "campaign", "value": "spring" },
                    { "api_id": "hold_id", "value": hold_id.to_string() }
                ]
            }}
        });
        let webhook: SignwellWebhook = serde_json::from_value(raw).unwrap();
        assert_eq!(webhook.event.kind, "document_completed");
        assert_eq!(webhook.data.object.hold_id().unwrap(), hold_id);
    }

    #[test]
    fn missing_hold_id_is_a_validation_error() {
        let webhook: SignwellWebhook = serde_json::from_value(serde_json::json!({
            "event": { "type": "document_sent" },
            "data": { "object": { "id": "env_7" } }
        }))
        .unwrap();
        assert!(matches!(
            webhook.data.object.hold_id(),
            Err(Error::Validation(_))
        ));
    }
}
