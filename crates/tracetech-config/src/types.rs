//! Typed entities and the boundary where untyped remote documents become them.
//!
//! Remote collections hold schemaless key/value documents. Every document that
//! enters canonical state passes through [`Entity::from_document`]; documents
//! that do not match the expected shape are rejected with a [`DecodeError`]
//! and never propagate inward.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// Field map of a remote document.
pub type Fields = serde_json::Map<String, JsonValue>;

/// Unique identifier of an actor.
pub type ActorId = String;

/// Unique identifier of a trace record.
pub type RecordId = String;

/// A schemaless document as delivered by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Read a top-level string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(JsonValue::as_str)
    }
}

/// Failure to turn a document into a typed entity.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("document '{id}' in '{collection}' is malformed: {source}")]
    Malformed {
        collection: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("patch for '{id}' in '{collection}' produced an invalid entity: {source}")]
    InvalidPatch {
        collection: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Shared behavior of every entity held in canonical state.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Remote collection the entity lives in.
    const COLLECTION: &'static str;

    fn id(&self) -> &str;

    /// Names of required fields that are empty.
    fn missing_fields(&self) -> Vec<&'static str>;

    fn from_document(doc: &Document) -> Result<Self, DecodeError> {
        let mut fields = doc.fields.clone();
        fields.insert("id".to_string(), JsonValue::String(doc.id.clone()));
        serde_json::from_value(JsonValue::Object(fields)).map_err(|source| {
            DecodeError::Malformed {
                collection: Self::COLLECTION,
                id: doc.id.clone(),
                source,
            }
        })
    }

    /// Document form without the `id` key; the id travels beside the fields.
    fn to_document(&self) -> Document {
        let mut fields = match serde_json::to_value(self) {
            Ok(JsonValue::Object(map)) => map,
            _ => Fields::new(),
        };
        fields.remove("id");
        Document::new(self.id().to_string(), fields)
    }

    /// Overlay a partial field map and re-decode, so a merge can never yield
    /// an entity that would fail decoding later.
    fn merged(&self, patch: &Fields) -> Result<Self, DecodeError> {
        let mut doc = self.to_document();
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            doc.fields.insert(key.clone(), value.clone());
        }
        Self::from_document(&doc).map_err(|err| match err {
            DecodeError::Malformed { id, source, .. } => DecodeError::InvalidPatch {
                collection: Self::COLLECTION,
                id,
                source,
            },
            other => other,
        })
    }
}

/// Serialize a partial update into a field map, dropping unset fields.
pub fn patch_fields<P: Serialize>(patch: &P) -> Fields {
    match serde_json::to_value(patch) {
        Ok(JsonValue::Object(map)) => map
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect(),
        _ => Fields::new(),
    }
}

/// Empty strings in remote documents mean "not set".
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Access level of an actor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Operator,
    Client,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Operator => "OPERATOR",
            Role::Client => "CLIENT",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated principal (a "user" in the remote store).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub username: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(
        rename = "password",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub credential_secret: Option<String>,
    pub role: Role,
    #[serde(
        rename = "company",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub affiliation: Option<String>,
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("display_name", &self.display_name)
            .field("has_credential", &self.credential_secret.is_some())
            .field("role", &self.role)
            .field("affiliation", &self.affiliation)
            .finish()
    }
}

impl Actor {
    pub fn new(
        id: impl Into<String>,
        username: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            display_name: display_name.into(),
            credential_secret: None,
            role,
            affiliation: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.credential_secret = Some(secret.into());
        self
    }

    pub fn with_affiliation(mut self, affiliation: impl Into<String>) -> Self {
        self.affiliation = Some(affiliation.into());
        self
    }

    /// Constant-shape credential comparison; absent secrets never match.
    pub fn credential_matches(&self, secret: &str) -> bool {
        match &self.credential_secret {
            Some(stored) => {
                stored.len() == secret.len()
                    && stored
                        .bytes()
                        .zip(secret.bytes())
                        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                        == 0
            }
            None => false,
        }
    }
}

impl Entity for Actor {
    const COLLECTION: &'static str = "users";

    fn id(&self) -> &str {
        &self.id
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.display_name.trim().is_empty() {
            missing.push("name");
        }
        if self.credential_secret.is_none() {
            missing.push("password");
        }
        missing
    }
}

/// Partial update of an actor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActorPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "password", skip_serializing_if = "Option::is_none")]
    pub credential_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(rename = "company", skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

/// External references attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachments {
    #[serde(
        rename = "pdfUrl",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub report_ref: Option<String>,
    #[serde(
        rename = "imageUrl",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_ref: Option<String>,
    #[serde(
        rename = "videoUrl",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub video_ref: Option<String>,
}

impl Attachments {
    pub fn is_empty(&self) -> bool {
        self.report_ref.is_none() && self.image_ref.is_none() && self.video_ref.is_none()
    }
}

/// A traceability record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: RecordId,
    pub code: String,
    #[serde(rename = "date")]
    pub occurred_on: NaiveDate,
    pub category: String,
    pub description: String,
    pub status: String,
    #[serde(rename = "assignedUserId")]
    pub assigned_actor_id: ActorId,
    #[serde(flatten)]
    pub attachments: Attachments,
    #[serde(
        rename = "technicalDetails",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<String>,
}

impl Entity for TraceRecord {
    const COLLECTION: &'static str = "records";

    fn id(&self) -> &str {
        &self.id
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.code.trim().is_empty() {
            missing.push("code");
        }
        if self.description.trim().is_empty() {
            missing.push("description");
        }
        missing
    }
}

/// Partial update of a record. Attachment fields set to an empty string clear
/// the reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "date", skip_serializing_if = "Option::is_none")]
    pub occurred_on: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "assignedUserId", skip_serializing_if = "Option::is_none")]
    pub assigned_actor_id: Option<String>,
    #[serde(rename = "pdfUrl", skip_serializing_if = "Option::is_none")]
    pub report_ref: Option<String>,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(rename = "videoUrl", skip_serializing_if = "Option::is_none")]
    pub video_ref: Option<String>,
    #[serde(rename = "technicalDetails", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RecordPatch {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }
}

/// One entry of a record's comment thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(rename = "recordId")]
    pub record_id: RecordId,
    #[serde(rename = "userId")]
    pub author_id: ActorId,
    #[serde(rename = "userName")]
    pub author_name: String,
    pub text: String,
    #[serde(rename = "createdAt")]
    pub posted_at: DateTime<Utc>,
}

impl Entity for Comment {
    const COLLECTION: &'static str = "comments";

    fn id(&self) -> &str {
        &self.id
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        if self.text.trim().is_empty() {
            vec!["text"]
        } else {
            Vec::new()
        }
    }
}

/// Which controlled vocabulary a [`ConfigEntity`] belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfigKind {
    Category,
    Status,
}

/// A category or status descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "isActive", default = "default_active")]
    pub active: bool,
    #[serde(rename = "type")]
    pub kind: ConfigKind,
    #[serde(
        rename = "icon",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub icon_hint: Option<String>,
}

fn default_active() -> bool {
    true
}

impl ConfigEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ConfigKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            active: true,
            kind,
            icon_hint: None,
        }
    }
}

impl Entity for ConfigEntity {
    const COLLECTION: &'static str = "settings";

    fn id(&self) -> &str {
        &self.id
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        if self.name.trim().is_empty() {
            vec!["name"]
        } else {
            Vec::new()
        }
    }
}

/// Partial update of a vocabulary entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "isActive", skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(rename = "icon", skip_serializing_if = "Option::is_none")]
    pub icon_hint: Option<String>,
}

/// Generate a fresh, time-ordered entity id.
pub fn new_entity_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, value: JsonValue) -> Document {
        match value {
            JsonValue::Object(fields) => Document::new(id, fields),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn decodes_record_with_wire_names() {
        let record = TraceRecord::from_document(&doc(
            "r1",
            json!({
                "code": "TRC-2024-001",
                "date": "2024-03-15",
                "category": "Inspección Técnica",
                "description": "Inspección estructural",
                "status": "CERRADO",
                "assignedUserId": "2",
                "pdfUrl": "https://example.com/a.pdf",
                "imageUrl": "",
                "createdAt": "2024-03-15T10:00:00Z"
            }),
        ))
        .unwrap();

        assert_eq!(record.id, "r1");
        assert_eq!(record.assigned_actor_id, "2");
        assert_eq!(
            record.attachments.report_ref.as_deref(),
            Some("https://example.com/a.pdf")
        );
        // Empty strings are treated as unset
        assert!(record.attachments.image_ref.is_none());
        assert!(record.notes.is_none());
    }

    #[test]
    fn malformed_record_is_rejected() {
        let err = TraceRecord::from_document(&doc("bad", json!({"code": "X", "date": "soon"})))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { collection: "records", .. }));
    }

    #[test]
    fn to_document_omits_id() {
        let actor = Actor::new("7", "ops", "Operator", Role::Operator).with_secret("pw");
        let doc = actor.to_document();
        assert_eq!(doc.id, "7");
        assert!(!doc.fields.contains_key("id"));
        assert_eq!(doc.str_field("password"), Some("pw"));
        assert_eq!(doc.str_field("role"), Some("OPERATOR"));
    }

    #[test]
    fn merged_overlays_partial_fields() {
        let record = TraceRecord::from_document(&doc(
            "r2",
            json!({
                "code": "T-2",
                "date": "2024-03-18",
                "category": "Mantenimiento",
                "description": "Cambio de filtros",
                "status": "ACTIVO",
                "assignedUserId": "2"
            }),
        ))
        .unwrap();

        let patch = patch_fields(&RecordPatch::status("CERRADO"));
        assert_eq!(patch.len(), 1);

        let merged = record.merged(&patch).unwrap();
        assert_eq!(merged.status, "CERRADO");
        assert_eq!(merged.code, "T-2");
    }

    #[test]
    fn merged_rejects_patch_that_breaks_shape() {
        let entity = ConfigEntity::new("c1", "Auditoría", ConfigKind::Category);
        let mut patch = Fields::new();
        patch.insert("type".to_string(), json!("SOMETHING_ELSE"));
        assert!(matches!(
            entity.merged(&patch),
            Err(DecodeError::InvalidPatch { .. })
        ));
    }

    #[test]
    fn actor_debug_redacts_secret() {
        let actor = Actor::new("1", "admin", "Administrador", Role::Admin).with_secret("1234");
        let rendered = format!("{:?}", actor);
        assert!(!rendered.contains("1234"));
        assert!(rendered.contains("has_credential: true"));
    }

    #[test]
    fn credential_match_requires_exact_secret() {
        let actor = Actor::new("1", "admin", "Administrador", Role::Admin).with_secret("1234");
        assert!(actor.credential_matches("1234"));
        assert!(!actor.credential_matches("123"));
        assert!(!actor.credential_matches("12345"));
        assert!(!Actor::new("2", "x", "X", Role::Client).credential_matches(""));
    }

    #[test]
    fn missing_fields_reports_required_gaps() {
        let actor = Actor::new("9", "", "Someone", Role::Client);
        assert_eq!(actor.missing_fields(), vec!["username", "password"]);
    }
}
