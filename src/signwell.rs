//! E-signature provider client.
//!
//! Creates and sends NDA envelopes from the configured template. The webhook
//! reactor handles everything after the envelope leaves our hands.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SignwellConfig;
use crate::models::Document;

#[derive(Error, Debug)]
pub enum SignwellError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },
}

#[derive(Clone)]
pub struct SignwellClient {
    http: reqwest::Client,
    config: SignwellConfig,
}

#[derive(Serialize)]
struct CreateDocumentRequest<'a> {
    template_id: &'a str,
    embedded_signing: bool,
    recipients: Vec<Recipient<'a>>,
    custom_fields: Vec<CustomField<'a>>,
}

#[derive(Serialize)]
struct Recipient<'a> {
    id: &'a str,
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct CustomField<'a> {
    api_id: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct CreateDocumentResponse {
    id: String,
}

impl SignwellClient {
    pub fn new(config: &SignwellConfig) -> Self {
        SignwellClient {
            http: reqwest::Client::new(),
            config: config.clone(),
        }
    }

    /// Creates a document from the NDA template, addressed to the document's
    /// signer, tagged with the hold id the webhook reactor keys on. Returns
    /// the provider's envelope id.
    pub async fn create_envelope(&self, document: &Document) -> Result<String, SignwellError> {
        let request = CreateDocumentRequest {
            template_id: &self.config.template_id,
            embedded_signing: false,
            recipients: vec![Recipient {
                id: "1",
                email: &document.signer_email,
                name: document.signer_name.as_deref(),
            }],
            custom_fields: vec![CustomField {
                api_id: "hold_id",
                value: document.hold_id.to_string(),
            }],
        };

        let response = self
            .http
            .post(format!("{}/document_templates/documents", self.config.base_url))
            .header("X-Api-Key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignwellError::Api { status: status.as_u16(), body });
        }

        let created: CreateDocumentResponse = response.json().await?;
        tracing::info!(document_id = %document.id, envelope_id = %created.id, "NDA envelope sent");
        Ok(created.id)
    }
}
