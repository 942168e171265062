//! Domain types and wire DTOs for the ChatVerse API
//!
//! All wire types follow the server's camelCase JSON convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The authenticated user, as the rest of the crate needs it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: i64,
    pub username: String,
}

/// Profile returned by `GET /users/me`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl From<UserProfile> for Identity {
    fn from(profile: UserProfile) -> Self {
        Identity {
            id: profile.id,
            username: profile.username,
        }
    }
}

/// A chat message, both in history responses and live deliveries.
///
/// The server names the primary key `messageId`; everything downstream of
/// the wire uses `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "messageId")]
    pub id: i64,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Outbound message body for both the streaming and REST send paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub recipient_id: i64,
    pub content: String,
}

/// Entry in the contact list (`GET /contacts`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub user_id: i64,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub friendship_status: Option<String>,
    #[serde(default)]
    pub became_contacts_at: Option<DateTime<Utc>>,
}

/// Pending contact request (`GET /contacts/requests/pending`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequest {
    /// Row id of the request; some server versions omit it
    #[serde(default)]
    pub contact_entity_id: Option<i64>,
    pub other_user_id: i64,
    #[serde(default)]
    pub other_user_username: Option<String>,
    #[serde(default)]
    pub other_user_name: Option<String>,
    #[serde(default)]
    pub request_status: Option<String>,
    #[serde(default)]
    pub direction: Option<RequestDirection>,
    #[serde(default)]
    pub request_timestamp: Option<DateTime<Utc>>,
}

/// Which side of a pending request to list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestDirection {
    Incoming,
    Outgoing,
}

impl RequestDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestDirection::Incoming => "INCOMING",
            RequestDirection::Outgoing => "OUTGOING",
        }
    }
}

/// Verdict on an incoming contact request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Accepted,
    Declined,
}

/// Response to `POST /users/check-auth-code`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOutcome {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    /// False when the phone number has no registered account yet
    #[serde(default = "default_user_exists")]
    pub user_exists: bool,
}

fn default_user_exists() -> bool {
    true
}

/// Response to `POST /users/refresh-token`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}
