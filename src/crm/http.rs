//! HTTP client for the CRM write API.

use crate::crm::{
    AssociationInput, AssociationRequest, CrmClient, CrmError, CrmErrorKind, FieldMap,
    RecordUpdate,
};
use crate::error::SimError;
use crate::types::{RecordId, RecordType};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Connection settings for the CRM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Private-app access token; usually supplied via `CRMSIM_CRM__ACCESS_TOKEN`.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Rate budget scope key. Defaults to a digest of the access token.
    #[serde(default)]
    pub credential_id: Option<String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for CrmSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_token: None,
            credential_id: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl CrmSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(format!("base_url '{}' must be an http(s) URL", self.base_url));
        }
        if self.request_timeout_ms == 0 {
            return Err("request_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Key identifying the credential's shared rate budget.
    pub fn credential_key(&self) -> String {
        if let Some(id) = &self.credential_id {
            return id.clone();
        }
        match &self.access_token {
            Some(token) => {
                let digest = blake3::hash(token.as_bytes());
                format!("token-{}", hex::encode(&digest.as_bytes()[..8]))
            }
            None => "anonymous".to_string(),
        }
    }
}

fn map_http_error(error: reqwest::Error) -> CrmError {
    if error.is_timeout() {
        CrmError::new(CrmErrorKind::Timeout, format!("Request timeout: {}", error))
    } else if error.is_connect() {
        CrmError::new(
            CrmErrorKind::Connection,
            format!("Connection error: {}", error),
        )
    } else if error.is_decode() {
        CrmError::new(
            CrmErrorKind::Other,
            format!("Failed to parse response: {}", error),
        )
    } else {
        CrmError::new(CrmErrorKind::Connection, format!("HTTP error: {}", error))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// CRM client speaking the objects/associations REST surface.
pub struct HttpCrmClient {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpCrmClient {
    pub fn new(settings: &CrmSettings) -> Result<Self, SimError> {
        settings.validate().map_err(SimError::ConfigError)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .map_err(|e| SimError::Crm(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            access_token: settings.access_token.clone(),
        })
    }

    async fn post(&self, url: &str, body: serde_json::Value) -> Result<Response, CrmError> {
        let mut request = self.client.post(url).json(&body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_http_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let wait = retry_after(response.headers());
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(CrmError::from_status(status, &text, wait))
    }

    /// One `associations/{from}/{to}/batch/create` call. Every input in
    /// `part` has the same target type.
    async fn create_association_batch(&self, part: &AssociationRequest) -> Result<usize, CrmError> {
        let Some(to_type) = part.inputs.first().map(|input| input.to_type) else {
            return Ok(0);
        };
        let url = format!(
            "{}/crm/v4/associations/{}/{}/batch/create",
            self.base_url,
            part.from_type.object_type(),
            to_type.object_type()
        );
        let mut inputs = Vec::with_capacity(part.inputs.len());
        for input in &part.inputs {
            let type_id = association_type_id(&input.association_type).ok_or_else(|| {
                CrmError::new(
                    CrmErrorKind::UnknownObjectType,
                    format!("Unknown association type: {}", input.association_type),
                )
            })?;
            inputs.push(json!({
                "from": { "id": part.from_id },
                "to": { "id": input.to_id },
                "types": [{
                    "associationCategory": part.category,
                    "associationTypeId": type_id,
                }],
            }));
        }
        let response = self.post(&url, json!({ "inputs": inputs })).await?;
        let batch: BatchResults = response.json().await.map_err(map_http_error)?;
        if !batch.errors.is_empty() {
            warn!(
                from = %part.from_id,
                to_type = %to_type,
                errors = batch.errors.len(),
                "CRM rejected some associations"
            );
            if batch.results.is_empty() {
                return Err(CrmError::new(
                    CrmErrorKind::Validation,
                    batch.errors[0].to_string(),
                ));
            }
        }
        debug!(
            from = %part.from_id,
            to_type = %to_type,
            links = part.inputs.len(),
            "CRM associations created"
        );
        Ok(if batch.results.is_empty() {
            part.inputs.len()
        } else {
            batch.results.len()
        })
    }
}

/// Group inputs by target type, keeping the first-seen order within a type.
fn split_by_target_type(request: &AssociationRequest) -> Vec<AssociationRequest> {
    let mut groups: BTreeMap<RecordType, Vec<AssociationInput>> = BTreeMap::new();
    for input in &request.inputs {
        groups.entry(input.to_type).or_default().push(input.clone());
    }
    groups
        .into_values()
        .map(|inputs| AssociationRequest {
            inputs,
            ..request.clone()
        })
        .collect()
}

/// Numeric association type id for a label. Numeric labels pass through;
/// `<from>_to_<to>` labels map to the CRM's predefined types.
fn association_type_id(label: &str) -> Option<u32> {
    if let Ok(id) = label.trim().parse::<u32>() {
        return Some(id);
    }
    let id = match label {
        "contact_to_company" => 279,
        "company_to_contact" => 280,
        "deal_to_contact" => 3,
        "contact_to_deal" => 4,
        "deal_to_company" => 341,
        "company_to_deal" => 342,
        "ticket_to_contact" => 16,
        "contact_to_ticket" => 15,
        "ticket_to_company" => 339,
        "company_to_ticket" => 340,
        "ticket_to_deal" => 28,
        "deal_to_ticket" => 27,
        "note_to_contact" => 202,
        "note_to_company" => 190,
        "note_to_deal" => 214,
        "note_to_ticket" => 228,
        "task_to_contact" => 204,
        "task_to_company" => 192,
        "task_to_deal" => 216,
        "task_to_ticket" => 230,
        _ => return None,
    };
    Some(id)
}

#[derive(Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Deserialize)]
struct BatchResults {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn create_record(
        &self,
        record_type: RecordType,
        fields: &FieldMap,
    ) -> Result<RecordId, CrmError> {
        let url = format!("{}/crm/v3/objects/{}", self.base_url, record_type.object_type());
        let response = self
            .post(&url, json!({ "properties": fields }))
            .await
            .map_err(|err| {
                // The object type is the only variable segment of this path.
                if err.kind == CrmErrorKind::NotFound {
                    CrmError {
                        kind: CrmErrorKind::UnknownObjectType,
                        ..err
                    }
                } else {
                    err
                }
            })?;
        let created: CreatedObject = response.json().await.map_err(map_http_error)?;
        debug!(record_type = %record_type, id = %created.id, "CRM record created");
        Ok(RecordId::new(created.id))
    }

    async fn create_associations(&self, request: &AssociationRequest) -> Result<usize, CrmError> {
        let mut linked = 0;
        for part in split_by_target_type(request) {
            linked += self.create_association_batch(&part).await?;
        }
        Ok(linked)
    }

    /// The batch endpoint takes one target object type per call.
    fn association_parts(&self, request: &AssociationRequest) -> Vec<AssociationRequest> {
        split_by_target_type(request)
    }

    async fn update_records(
        &self,
        record_type: RecordType,
        updates: &[RecordUpdate],
    ) -> Result<usize, CrmError> {
        let url = format!(
            "{}/crm/v3/objects/{}/batch/update",
            self.base_url,
            record_type.object_type()
        );
        let inputs: Vec<serde_json::Value> = updates
            .iter()
            .map(|u| json!({ "id": u.id, "properties": u.fields }))
            .collect();
        let response = self.post(&url, json!({ "inputs": inputs })).await?;
        let batch: BatchResults = response.json().await.map_err(map_http_error)?;
        Ok(if batch.results.is_empty() {
            updates.len()
        } else {
            batch.results.len()
        })
    }
}
