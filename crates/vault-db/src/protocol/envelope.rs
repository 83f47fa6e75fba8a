//! Wire envelope and the closed request schema.
//!
//! Every message between contexts is an [`Envelope`]:
//! `{"service":"device","operation":"entity:create","payload":{..},"messageId":".."}`.
//! A message with `messageId` expects a matching `RESPONSE`; one without is a
//! fire-and-forget event.
//!
//! Requests are decoded into per-service enums discriminated by `operation`
//! so handlers match exhaustively instead of probing payload fields.

use super::{ProtocolError, Result};
use crate::content::RichDocument;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Operation name carried by responses.
pub const RESPONSE: &str = "RESPONSE";

/// Services a context can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKey {
    /// Filesystem entity CRUD and directory queries.
    Device,
    /// Markdown ⇄ rich model conversion.
    Utils,
    /// Remote entity fetch.
    Cloud,
    /// UI state sink. Write-only.
    Store,
    /// The database context itself.
    Database,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceKey::Device => "device",
            ServiceKey::Utils => "utils",
            ServiceKey::Cloud => "cloud",
            ServiceKey::Store => "store",
            ServiceKey::Database => "database",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub service: ServiceKey,
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Set on responses whose handler failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Fire-and-forget event.
    pub fn event(service: ServiceKey, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            service,
            operation: operation.into(),
            payload,
            message_id: None,
            error: None,
        }
    }

    /// Request expecting a response under `message_id`.
    pub fn request(
        service: ServiceKey,
        operation: impl Into<String>,
        payload: Value,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Self::event(service, operation, payload)
        }
    }

    /// Successful response to `self`.
    pub fn respond(&self, payload: Value) -> Self {
        Self {
            service: self.service,
            operation: RESPONSE.to_string(),
            payload,
            message_id: self.message_id.clone(),
            error: None,
        }
    }

    /// Failed response to `self`.
    pub fn respond_error(&self, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..self.respond(Value::Null)
        }
    }

    pub fn is_response(&self) -> bool {
        self.operation == RESPONSE
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or a message missing required fields.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// A file-backed record as the device service sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub vault_id: String,
    /// Vault-relative path.
    pub filepath: String,
    /// Text content for documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Base64 bytes for attachments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub vault_id: String,
    pub entities: Vec<DeviceRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub mods: DeviceRecord,
    pub old_obj: DeviceRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPayload {
    pub vault_id: String,
    pub filepath: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadBatchPayload {
    pub vault_id: String,
    pub filepaths: Vec<String>,
}

/// Requests answered by the device service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload")]
pub enum DeviceRequest {
    #[serde(rename = "entity:create")]
    EntityCreate(DeviceRecord),
    #[serde(rename = "entity:createBatch")]
    EntityCreateBatch(BatchPayload),
    #[serde(rename = "entity:update")]
    EntityUpdate(UpdatePayload),
    #[serde(rename = "entity:delete")]
    EntityDelete(DeviceRecord),
    #[serde(rename = "entity:read")]
    EntityRead(PathPayload),
    #[serde(rename = "entity:batchRead")]
    EntityBatchRead(ReadBatchPayload),
    #[serde(rename = "project:create")]
    ProjectCreate(DeviceRecord),
    #[serde(rename = "project:createBatch")]
    ProjectCreateBatch(BatchPayload),
    #[serde(rename = "project:update")]
    ProjectUpdate(UpdatePayload),
    #[serde(rename = "project:delete")]
    ProjectDelete(DeviceRecord),
    #[serde(rename = "project:isDir")]
    ProjectIsDir(PathPayload),
    #[serde(rename = "project:listRecursive")]
    ProjectListRecursive(PathPayload),
    #[serde(rename = "attachment:create")]
    AttachmentCreate(DeviceRecord),
    #[serde(rename = "attachment:createBatch")]
    AttachmentCreateBatch(BatchPayload),
    #[serde(rename = "attachment:delete")]
    AttachmentDelete(DeviceRecord),
    /// Responds with the record, bytes in `data`, or `null`.
    #[serde(rename = "attachment:read")]
    AttachmentRead(PathPayload),
}

impl DeviceRequest {
    pub const OPERATIONS: &'static [&'static str] = &[
        "entity:create",
        "entity:createBatch",
        "entity:update",
        "entity:delete",
        "entity:read",
        "entity:batchRead",
        "project:create",
        "project:createBatch",
        "project:update",
        "project:delete",
        "project:isDir",
        "project:listRecursive",
        "attachment:create",
        "attachment:createBatch",
        "attachment:delete",
        "attachment:read",
    ];

    pub fn operation(&self) -> &'static str {
        match self {
            DeviceRequest::EntityCreate(_) => "entity:create",
            DeviceRequest::EntityCreateBatch(_) => "entity:createBatch",
            DeviceRequest::EntityUpdate(_) => "entity:update",
            DeviceRequest::EntityDelete(_) => "entity:delete",
            DeviceRequest::EntityRead(_) => "entity:read",
            DeviceRequest::EntityBatchRead(_) => "entity:batchRead",
            DeviceRequest::ProjectCreate(_) => "project:create",
            DeviceRequest::ProjectCreateBatch(_) => "project:createBatch",
            DeviceRequest::ProjectUpdate(_) => "project:update",
            DeviceRequest::ProjectDelete(_) => "project:delete",
            DeviceRequest::ProjectIsDir(_) => "project:isDir",
            DeviceRequest::ProjectListRecursive(_) => "project:listRecursive",
            DeviceRequest::AttachmentCreate(_) => "attachment:create",
            DeviceRequest::AttachmentCreateBatch(_) => "attachment:createBatch",
            DeviceRequest::AttachmentDelete(_) => "attachment:delete",
            DeviceRequest::AttachmentRead(_) => "attachment:read",
        }
    }
}

/// Requests answered by the conversion service. Results are index-aligned
/// with `items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all_fields = "camelCase")]
pub enum UtilsRequest {
    #[serde(rename = "utils:parseMarkdown")]
    ParseMarkdown { vault_id: String, items: Vec<String> },
    #[serde(rename = "utils:parseRichText")]
    ParseRichText {
        vault_id: String,
        items: Vec<RichDocument>,
    },
}

impl UtilsRequest {
    pub const OPERATIONS: &'static [&'static str] = &["utils:parseMarkdown", "utils:parseRichText"];

    pub fn operation(&self) -> &'static str {
        match self {
            UtilsRequest::ParseMarkdown { .. } => "utils:parseMarkdown",
            UtilsRequest::ParseRichText { .. } => "utils:parseRichText",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all_fields = "camelCase")]
pub enum CloudRequest {
    /// Fetch one remote row. Responds with the row or `null`.
    #[serde(rename = "cloud:retrieve")]
    Retrieve {
        vault_id: String,
        table: String,
        id: String,
    },
}

impl CloudRequest {
    pub const OPERATIONS: &'static [&'static str] = &["cloud:retrieve"];

    pub fn operation(&self) -> &'static str {
        match self {
            CloudRequest::Retrieve { .. } => "cloud:retrieve",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all_fields = "camelCase")]
pub enum StoreRequest {
    /// Ask the UI to re-read the conflict table of a vault.
    #[serde(rename = "dispatch:localConflicts/checkConflicts")]
    CheckConflicts { vault_id: String },
}

impl StoreRequest {
    pub const OPERATIONS: &'static [&'static str] = &["dispatch:localConflicts/checkConflicts"];

    pub fn operation(&self) -> &'static str {
        match self {
            StoreRequest::CheckConflicts { .. } => "dispatch:localConflicts/checkConflicts",
        }
    }
}

/// Any request the database context sends or serves.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Device(DeviceRequest),
    Utils(UtilsRequest),
    Cloud(CloudRequest),
    Store(StoreRequest),
}

impl Request {
    pub fn service(&self) -> ServiceKey {
        match self {
            Request::Device(_) => ServiceKey::Device,
            Request::Utils(_) => ServiceKey::Utils,
            Request::Cloud(_) => ServiceKey::Cloud,
            Request::Store(_) => ServiceKey::Store,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Request::Device(r) => r.operation(),
            Request::Utils(r) => r.operation(),
            Request::Cloud(r) => r.operation(),
            Request::Store(r) => r.operation(),
        }
    }

    /// Split into `(operation, payload)` for an envelope.
    pub fn into_parts(self) -> Result<(&'static str, Value)> {
        let operation = self.operation();
        let tagged = match self {
            Request::Device(r) => serde_json::to_value(r),
            Request::Utils(r) => serde_json::to_value(r),
            Request::Cloud(r) => serde_json::to_value(r),
            Request::Store(r) => serde_json::to_value(r),
        }
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        let payload = match tagged {
            Value::Object(mut map) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok((operation, payload))
    }

    /// Decode an incoming envelope. Operations outside the service's schema
    /// are rejected before the payload is looked at.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let unknown = || ProtocolError::UnknownOperation {
            service: envelope.service,
            operation: envelope.operation.clone(),
        };
        let known = match envelope.service {
            ServiceKey::Device => DeviceRequest::OPERATIONS,
            ServiceKey::Utils => UtilsRequest::OPERATIONS,
            ServiceKey::Cloud => CloudRequest::OPERATIONS,
            ServiceKey::Store => StoreRequest::OPERATIONS,
            ServiceKey::Database => &[],
        };
        if !known.contains(&envelope.operation.as_str()) {
            return Err(unknown());
        }

        let mut tagged = Map::new();
        tagged.insert("operation".into(), Value::String(envelope.operation.clone()));
        tagged.insert("payload".into(), envelope.payload.clone());
        let tagged = Value::Object(tagged);

        let decoded = match envelope.service {
            ServiceKey::Device => serde_json::from_value(tagged).map(Request::Device),
            ServiceKey::Utils => serde_json::from_value(tagged).map(Request::Utils),
            ServiceKey::Cloud => serde_json::from_value(tagged).map(Request::Cloud),
            ServiceKey::Store => serde_json::from_value(tagged).map(Request::Store),
            ServiceKey::Database => return Err(unknown()),
        };
        decoded.map_err(|e| ProtocolError::InvalidPayload(format!("{}: {}", envelope.operation, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> DeviceRecord {
        DeviceRecord {
            id: "d1".into(),
            vault_id: "v1".into(),
            filepath: "notes/plan.md".into(),
            content: Some("# Plan".into()),
            data: None,
        }
    }

    // ==================== Envelope ====================

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::request(ServiceKey::Device, "entity:read", json!({}), "m-1");
        let json = String::from_utf8(envelope.to_json().unwrap()).unwrap();

        assert!(json.contains("\"service\":\"device\""));
        assert!(json.contains("\"messageId\":\"m-1\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_event_has_no_message_id() {
        let envelope = Envelope::event(ServiceKey::Store, "dispatch:x", json!(null));
        let json = String::from_utf8(envelope.to_json().unwrap()).unwrap();
        assert!(!json.contains("messageId"));
    }

    #[test]
    fn test_response_keeps_message_id() {
        let request = Envelope::request(ServiceKey::Device, "entity:create", json!({}), "m-7");
        let response = request.respond(json!(true));

        assert!(response.is_response());
        assert_eq!(response.message_id.as_deref(), Some("m-7"));

        let failed = request.respond_error("disk full");
        assert_eq!(failed.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_envelope_invalid_json() {
        assert!(Envelope::from_json(b"not json").is_none());
        assert!(Envelope::from_json(br#"{"service":"nope","operation":"x"}"#).is_none());
    }

    // ==================== Request schema ====================

    #[test]
    fn test_device_request_payload_shape() {
        let request = Request::Device(DeviceRequest::EntityUpdate(UpdatePayload {
            mods: record(),
            old_obj: record(),
        }));
        let (operation, payload) = request.into_parts().unwrap();

        assert_eq!(operation, "entity:update");
        assert_eq!(payload["mods"]["vaultId"], "v1");
        assert_eq!(payload["oldObj"]["filepath"], "notes/plan.md");
    }

    #[test]
    fn test_decode_known_operation() {
        let envelope = Envelope::request(
            ServiceKey::Device,
            "project:isDir",
            json!({"vaultId": "v1", "filepath": "notes"}),
            "m-1",
        );

        match Request::from_envelope(&envelope).unwrap() {
            Request::Device(DeviceRequest::ProjectIsDir(path)) => {
                assert_eq!(path.filepath, "notes");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_operation() {
        let envelope = Envelope::request(ServiceKey::Device, "entity:explode", json!({}), "m-1");
        let err = Request::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOperation { .. }));
    }

    #[test]
    fn test_decode_bad_payload() {
        let envelope = Envelope::request(ServiceKey::Store, StoreRequest::OPERATIONS[0], json!(42), "m-1");
        let err = Request::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn test_operation_tables_match_variants() {
        let samples = [
            Request::Store(StoreRequest::CheckConflicts {
                vault_id: "v1".into(),
            }),
            Request::Cloud(CloudRequest::Retrieve {
                vault_id: "v1".into(),
                table: "images".into(),
                id: "i1".into(),
            }),
            Request::Utils(UtilsRequest::ParseMarkdown {
                vault_id: "v1".into(),
                items: vec!["# a".into()],
            }),
        ];
        for request in samples {
            let service = request.service();
            let (operation, payload) = request.clone().into_parts().unwrap();
            let envelope = Envelope::request(service, operation, payload, "m");
            assert_eq!(Request::from_envelope(&envelope).unwrap(), request);
        }
    }
}
