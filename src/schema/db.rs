use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Anything stored as a document with a backend-assigned identifier.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// Explicit `null` decodes like a missing field.
fn nullable<'de, D, V>(deserializer: D) -> Result<V, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de> + Default,
{
    Ok(Option::<V>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Open,
        Status::InProgress,
        Status::Resolved,
        Status::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in-progress",
            Status::Resolved => "resolved",
            Status::Closed => "closed",
        }
    }
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "in-progress" | "in_progress" | "inprogress" => Status::InProgress,
            "resolved" | "solved" => Status::Resolved,
            "closed" => Status::Closed,
            _ => Status::Open,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Role {
    #[default]
    Standard,
    Admin,
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::Standard
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Standard => f.write_str("standard"),
            Role::Admin => f.write_str("admin"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Complaint {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(deserialize_with = "nullable")]
    pub title: String,
    #[serde(deserialize_with = "nullable")]
    pub description: String,
    #[serde(deserialize_with = "nullable")]
    pub category: String,
    #[serde(deserialize_with = "nullable")]
    pub status: Status,
    #[serde(deserialize_with = "nullable")]
    pub image: String,
    #[serde(deserialize_with = "nullable")]
    pub created_by: String,
    #[serde(skip_serializing)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "nullable")]
    pub upvotes: BTreeSet<String>,
}

impl Complaint {
    pub fn upvoted_by(&self, uid: &str) -> bool {
        self.upvotes.contains(uid)
    }
}

impl Record for Complaint {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Comment {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(deserialize_with = "nullable")]
    pub text: String,
    #[serde(deserialize_with = "nullable")]
    pub created_by: String,
    #[serde(skip_serializing)]
    pub created_at: Option<DateTime<Utc>>,
    /// Set on local drafts that the backend has not confirmed yet.
    #[serde(skip)]
    pub pending: bool,
}

impl Record for Comment {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Admin-only annotation on a complaint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Note {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(deserialize_with = "nullable")]
    pub text: String,
    #[serde(deserialize_with = "nullable")]
    pub created_by: String,
    #[serde(skip_serializing)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Record for Note {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRecord {
    #[serde(skip_serializing)]
    pub id: String,
    #[serde(rename = "name", deserialize_with = "nullable")]
    pub display_name: String,
    #[serde(deserialize_with = "nullable")]
    pub email: String,
    #[serde(deserialize_with = "nullable")]
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Record for UserRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_status_values_decode() {
        let complaint: Complaint = serde_json::from_value(json!({
            "title": "Leaky tap",
            "status": "solved",
        }))
        .unwrap();
        assert_eq!(complaint.status, Status::Resolved);

        let complaint: Complaint = serde_json::from_value(json!({ "title": "No status" })).unwrap();
        assert_eq!(complaint.status, Status::Open);
        assert!(complaint.upvotes.is_empty());
        assert_eq!(complaint.image, "");
    }

    #[test]
    fn null_fields_fall_back_to_defaults() {
        let complaint: Complaint = serde_json::from_value(json!({
            "title": "Flickering lights",
            "category": null,
            "status": null,
            "image": null,
            "upvotes": null,
        }))
        .unwrap();
        assert_eq!(complaint.title, "Flickering lights");
        assert_eq!(complaint.status, Status::Open);
        assert_eq!(complaint.category, "");
        assert_eq!(complaint.image, "");
        assert!(complaint.upvotes.is_empty());

        let comment: Comment =
            serde_json::from_value(json!({ "text": null, "createdBy": "u1" })).unwrap();
        assert_eq!(comment.text, "");
        let user: UserRecord = serde_json::from_value(json!({ "name": null, "role": null })).unwrap();
        assert_eq!(user.role, Role::Standard);
    }

    #[test]
    fn duplicate_upvotes_collapse() {
        let complaint: Complaint = serde_json::from_value(json!({
            "upvotes": ["alice", "bob", "alice"],
        }))
        .unwrap();
        assert_eq!(complaint.upvotes.len(), 2);
        assert!(complaint.upvoted_by("alice"));
    }

    #[test]
    fn serialized_complaint_uses_store_field_names() {
        let complaint = Complaint {
            id: "ignored".into(),
            title: "Broken AC".into(),
            status: Status::InProgress,
            created_by: "u1".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&complaint).unwrap();
        assert_eq!(value["createdBy"], "u1");
        assert_eq!(value["status"], "in-progress");
        assert!(value.get("id").is_none());
        assert!(value.get("createdAt").is_none());
    }

    #[test]
    fn user_role_defaults_to_standard() {
        let user: UserRecord =
            serde_json::from_value(json!({ "name": "Ada", "role": "ADMIN" })).unwrap();
        assert_eq!(user.role, Role::Admin);
        let user: UserRecord = serde_json::from_value(json!({ "name": "Bo" })).unwrap();
        assert_eq!(user.role, Role::Standard);
        assert_eq!(user.display_name, "Bo");
    }
}
