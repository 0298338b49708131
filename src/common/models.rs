// Records mirrored from the marketplace API
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Uniform `{message, statusCode, data, timestamp}` wrapper of every API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    pub data: Option<T>,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    pub timestamp: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub token: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "profileImageURL")]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, rename = "profileImageURL")]
    pub profile_image_url: Option<String>,
}

impl UserProfile {
    /// "First Last", or `None` when both parts are blank.
    pub fn display_name(&self) -> Option<String> {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

/// Profile update payload; the email travels as a query parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "profileImageURL")]
    pub profile_image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    pub email: String,
    #[serde(default, rename = "profileImageURL")]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub description: String,
    pub category: String,
    pub condition: String,
    pub email: String,
    #[serde(default)]
    pub item_post_image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_datetime",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<NaiveDateTime>,
    /// Filled in client-side from the owner's profile.
    #[serde(default, skip_serializing)]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing)]
    pub user_image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DonationStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

impl DonationStatus {
    pub fn description(&self) -> &'static str {
        match self {
            DonationStatus::Pending => "Pending Approval",
            DonationStatus::Accepted => "Accepted by Recipient",
            DonationStatus::Rejected => "Rejected by Recipient",
            DonationStatus::Cancelled => "Cancelled",
        }
    }
}

impl FromStr for DonationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DonationStatus::Pending),
            "ACCEPTED" => Ok(DonationStatus::Accepted),
            "REJECTED" => Ok(DonationStatus::Rejected),
            "CANCELLED" => Ok(DonationStatus::Cancelled),
            _ => Err(format!("Invalid donation status: {}", s)),
        }
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DonationStatus::Pending => "PENDING",
            DonationStatus::Accepted => "ACCEPTED",
            DonationStatus::Rejected => "REJECTED",
            DonationStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: i64,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub status: Option<DonationStatus>,
    pub user: User,
    pub item_post: Post,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DonateRequest {
    pub item_post_id: i64,
    pub user_id: i64,
}

/// Chat message as published on `/app/chat` and delivered on user queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default, deserialize_with = "de_opt_datetime")]
    pub timestamp: Option<NaiveDateTime>,
}

impl ChatMessage {
    pub fn outgoing(sender_id: &str, recipient_id: &str, content: &str) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            timestamp: Some(Utc::now().naive_utc()),
        }
    }
}

macro_rules! labelled_enum {
    ($name:ident { $($variant:ident => ($wire:literal, $label:literal)),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn wire_name(&self) -> &'static str {
                match self { $($name::$variant => $wire),+ }
            }

            pub fn label(&self) -> &'static str {
                match self { $($name::$variant => $label),+ }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.wire_name().eq_ignore_ascii_case(s))
                    .ok_or_else(|| format!("Invalid {}: {}", stringify!($name).to_lowercase(), s))
            }
        }
    };
}

labelled_enum!(Category {
    Furniture => ("FURNITURE", "Furniture"),
    Electronics => ("ELECTRONICS", "Electronics"),
    Books => ("BOOKS", "Books"),
    Vehicle => ("VEHICLE", "Vehicle"),
    Clothing => ("CLOTHING", "Clothing"),
    Toys => ("TOYS", "Toys"),
    SportsEquipment => ("SPORTS_EQUIPMENT", "Sports Equipment"),
    HomeAppliances => ("HOME_APPLIANCES", "Home Appliances"),
    Healthcare => ("HEALTHCARE", "Healthcare"),
    SchoolSupplies => ("SCHOOL_SUPPLIES", "School Supplies"),
    Food => ("FOOD", "Food"),
    BabyProducts => ("BABY_PRODUCTS", "Baby Products"),
    PetSupplies => ("PET_SUPPLIES", "Pet Supplies"),
    ArtSupplies => ("ART_SUPPLIES", "Art Supplies"),
    Tools => ("TOOLS", "Tools"),
    MusicalInstruments => ("MUSICAL_INSTRUMENTS", "Musical Instruments"),
    Misc => ("MISC", "Miscellaneous"),
});

labelled_enum!(Condition {
    New => ("NEW", "Brand New"),
    LikeNew => ("LIKE_NEW", "Like New"),
    Good => ("GOOD", "Good Condition"),
    Fair => ("FAIR", "Fair Condition"),
    Poor => ("POOR", "Poor Condition"),
    Damaged => ("DAMAGED", "Damaged"),
});

/// Server timestamps arrive either as ISO strings or as Jackson's
/// `[year, month, day, hour, minute, second, nanos]` arrays.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDateTime {
    Text(String),
    Parts(Vec<i64>),
}

fn parse_datetime_text(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

fn parse_datetime_parts(parts: &[i64]) -> Option<NaiveDateTime> {
    let get = |i: usize| parts.get(i).copied().unwrap_or(0);
    if parts.len() < 3 {
        return None;
    }
    NaiveDate::from_ymd_opt(get(0) as i32, get(1) as u32, get(2) as u32)?.and_hms_nano_opt(
        get(3) as u32,
        get(4) as u32,
        get(5) as u32,
        get(6) as u32,
    )
}

fn de_opt_datetime<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawDateTime>::deserialize(deserializer)?;
    Ok(raw.and_then(|r| match r {
        RawDateTime::Text(s) => parse_datetime_text(&s),
        RawDateTime::Parts(p) => parse_datetime_parts(&p),
    }))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(|id| match id {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_with_null_data() {
        let env: Envelope<Vec<Post>> =
            serde_json::from_str(r#"{"message":"ok","statusCode":200,"data":null}"#).unwrap();
        assert!(env.data.is_none());
        assert_eq!(env.status_code, Some(200));
    }

    #[test]
    fn test_chat_message_accepts_array_timestamp_and_numeric_id() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"id":42,"senderId":"a@x.io","recipientId":"b@x.io","content":"hi","timestamp":[2024,11,3,14,5,9,120000000]}"#,
        )
        .unwrap();
        assert_eq!(msg.id.as_deref(), Some("42"));
        let ts = msg.timestamp.unwrap();
        assert_eq!(ts.to_string(), "2024-11-03 14:05:09.120");
    }

    #[test]
    fn test_chat_message_accepts_iso_timestamp() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"senderId":"a","recipientId":"b","content":"hi","timestamp":"2024-11-03T14:05:09.000Z"}"#,
        )
        .unwrap();
        assert!(msg.id.is_none());
        assert_eq!(msg.timestamp.unwrap().to_string(), "2024-11-03 14:05:09");
    }

    #[test]
    fn test_outgoing_message_serializes_camel_case() {
        let msg = ChatMessage::outgoing("a@x.io", "b@x.io", "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["senderId"], "a@x.io");
        assert_eq!(json["recipientId"], "b@x.io");
        assert_eq!(json["content"], "hello");
    }

    #[test]
    fn test_donation_status_parsing_is_case_insensitive() {
        assert_eq!("pending".parse::<DonationStatus>(), Ok(DonationStatus::Pending));
        assert_eq!("Cancelled".parse::<DonationStatus>(), Ok(DonationStatus::Cancelled));
        assert!("shipped".parse::<DonationStatus>().is_err());
        let donation: Donation = serde_json::from_str(
            r#"{"id":1,"status":"ACCEPTED","user":{"id":2,"email":"u@x.io"},
                "itemPost":{"id":3,"title":"Desk","description":"Oak","category":"FURNITURE",
                "condition":"GOOD","email":"o@x.io","itemPostImageUrl":""}}"#,
        )
        .unwrap();
        assert_eq!(donation.status, Some(DonationStatus::Accepted));
    }

    #[test]
    fn test_category_and_condition_labels() {
        assert_eq!("sports_equipment".parse::<Category>(), Ok(Category::SportsEquipment));
        assert_eq!(Category::Misc.label(), "Miscellaneous");
        assert_eq!(Condition::LikeNew.wire_name(), "LIKE_NEW");
        assert_eq!("new".parse::<Condition>().unwrap().label(), "Brand New");
        assert!("mint".parse::<Condition>().is_err());
    }

    #[test]
    fn test_display_name() {
        let mut profile = UserProfile::default();
        assert_eq!(profile.display_name(), None);
        profile.first_name = Some("Ada".into());
        assert_eq!(profile.display_name().as_deref(), Some("Ada"));
        profile.last_name = Some("Lovelace".into());
        assert_eq!(profile.display_name().as_deref(), Some("Ada Lovelace"));
    }
}
