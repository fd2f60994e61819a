//! Event envelope and per-type bodies.
//!
//! The envelope is decoded eagerly by the stream; `body` is kept as raw JSON
//! and decoded on demand by the `as_*` accessors, which reject events of a
//! different type with [`BodyError::WrongType`].

use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseFloatError;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use thiserror::Error;

/// Kind of an [`Event`]. Kinds this crate does not know are kept verbatim in
/// [`EventType::Unknown`] so they never abort a stream.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    PushBody,
    Open,
    Send,
    Close,
    TagChange,
    Uninstall,
    FirstOpen,
    Custom,
    Location,
    RichDelivery,
    RichRead,
    RichDelete,
    InAppMessageDisplay,
    InAppMessageExpiration,
    InAppMessageResolution,
    Unknown(String),
}

impl EventType {
    /// Every kind with a dedicated variant.
    pub const KNOWN: [EventType; 15] = [
        EventType::PushBody,
        EventType::Open,
        EventType::Send,
        EventType::Close,
        EventType::TagChange,
        EventType::Uninstall,
        EventType::FirstOpen,
        EventType::Custom,
        EventType::Location,
        EventType::RichDelivery,
        EventType::RichRead,
        EventType::RichDelete,
        EventType::InAppMessageDisplay,
        EventType::InAppMessageExpiration,
        EventType::InAppMessageResolution,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::PushBody => "PUSH_BODY",
            Self::Open => "OPEN",
            Self::Send => "SEND",
            Self::Close => "CLOSE",
            Self::TagChange => "TAG_CHANGE",
            Self::Uninstall => "UNINSTALL",
            Self::FirstOpen => "FIRST_OPEN",
            Self::Custom => "CUSTOM",
            Self::Location => "LOCATION",
            Self::RichDelivery => "RICH_DELIVERY",
            Self::RichRead => "RICH_READ",
            Self::RichDelete => "RICH_DELETE",
            Self::InAppMessageDisplay => "IN_APP_MESSAGE_DISPLAY",
            Self::InAppMessageExpiration => "IN_APP_MESSAGE_EXPIRATION",
            Self::InAppMessageResolution => "IN_APP_MESSAGE_RESOLUTION",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .unwrap_or(Self::Unknown(raw))
    }
}

impl From<&str> for EventType {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<EventType> for String {
    fn from(kind: EventType) -> Self {
        match kind {
            EventType::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel identifiers of the device an event relates to.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Device {
    #[serde(rename = "amazon_channel", default, skip_serializing_if = "Option::is_none")]
    pub amazon: Option<String>,
    #[serde(rename = "android_channel", default, skip_serializing_if = "Option::is_none")]
    pub android: Option<String>,
    #[serde(rename = "ios_channel", default, skip_serializing_if = "Option::is_none")]
    pub ios: Option<String>,
    #[serde(rename = "named_user_id", default, skip_serializing_if = "Option::is_none")]
    pub named_user: Option<String>,
}

impl Device {
    /// Reports whether any identifier is present and non-empty.
    pub fn has_channel(&self) -> bool {
        [&self.amazon, &self.android, &self.ios, &self.named_user]
            .into_iter()
            .any(|id| id.as_deref().is_some_and(|id| !id.is_empty()))
    }
}

/// One event from the stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub occurred: DateTime<Utc>,
    pub processed: DateTime<Utc>,
    /// Resume cursor; a decimal string on the wire.
    #[serde(with = "offset_string")]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<RawValue>>,
}

impl Event {
    /// Raw JSON body, if the event carried one.
    pub fn raw_body(&self) -> Option<&str> {
        self.body.as_deref().map(RawValue::get)
    }

    pub fn as_push(&self) -> Result<PushBody, BodyError> {
        self.body_as(self.kind == EventType::PushBody, "PUSH_BODY")
    }

    pub fn as_open(&self) -> Result<Open, BodyError> {
        self.body_as(self.kind == EventType::Open, "OPEN")
    }

    pub fn as_send(&self) -> Result<Send, BodyError> {
        self.body_as(self.kind == EventType::Send, "SEND")
    }

    pub fn as_close(&self) -> Result<Close, BodyError> {
        self.body_as(self.kind == EventType::Close, "CLOSE")
    }

    pub fn as_tag_change(&self) -> Result<TagChange, BodyError> {
        self.body_as(self.kind == EventType::TagChange, "TAG_CHANGE")
    }

    pub fn as_location(&self) -> Result<Location, BodyError> {
        self.body_as(self.kind == EventType::Location, "LOCATION")
    }

    pub fn as_custom(&self) -> Result<Custom, BodyError> {
        self.body_as(self.kind == EventType::Custom, "CUSTOM")
    }

    /// Decodes RICH_DELIVERY, RICH_READ and RICH_DELETE bodies.
    pub fn as_rich_event(&self) -> Result<RichEvent, BodyError> {
        self.body_as(
            matches!(
                self.kind,
                EventType::RichDelivery | EventType::RichRead | EventType::RichDelete
            ),
            "RICH_DELIVERY|RICH_READ|RICH_DELETE",
        )
    }

    pub fn as_in_app_message_display(&self) -> Result<InAppMessageDisplay, BodyError> {
        self.body_as(
            self.kind == EventType::InAppMessageDisplay,
            "IN_APP_MESSAGE_DISPLAY",
        )
    }

    pub fn as_in_app_message_expiration(&self) -> Result<InAppMessageExpiration, BodyError> {
        self.body_as(
            self.kind == EventType::InAppMessageExpiration,
            "IN_APP_MESSAGE_EXPIRATION",
        )
    }

    pub fn as_in_app_message_resolution(&self) -> Result<InAppMessageResolution, BodyError> {
        self.body_as(
            self.kind == EventType::InAppMessageResolution,
            "IN_APP_MESSAGE_RESOLUTION",
        )
    }

    fn body_as<T: DeserializeOwned>(
        &self,
        matches: bool,
        expected: &'static str,
    ) -> Result<T, BodyError> {
        if !matches {
            return Err(BodyError::WrongType {
                expected,
                actual: self.kind.clone(),
            });
        }
        let raw = self.raw_body().unwrap_or("{}");
        Ok(serde_json::from_str(raw)?)
    }
}

/// Reference to a push, optionally within a group (automation or local-time
/// pushes).
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct PushRef {
    pub push_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Specification of a push as sent through the API.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct PushBody {
    pub push_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Push payload; base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Set when the server truncated an oversized payload.
    #[serde(default)]
    pub trimmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Open {
    /// Last push the server attempted to deliver to the device, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_received: Option<PushRef>,
    /// Push the open is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converting_push: Option<PushRef>,
    /// Absent when the app was initialized in the background.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Emitted for each device addressed by a push.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Send {
    pub push_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Emitted when the app is closed. Often delivered late.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Close {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Tag groups mapped to tag names.
pub type TagSet = BTreeMap<String, Vec<String>>;

#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TagChange {
    #[serde(default)]
    pub add: TagSet,
    #[serde(default)]
    pub remove: TagSet,
    /// Device tags after the change was applied.
    #[serde(default)]
    pub current: TagSet,
}

impl TagChange {
    pub fn has_changes(&self) -> bool {
        !self.add.is_empty() || !self.remove.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Location {
    #[serde(deserialize_with = "decimal_string")]
    pub latitude: String,
    #[serde(deserialize_with = "decimal_string")]
    pub longitude: String,
    /// Whether the app was in the foreground when the location was taken.
    #[serde(default)]
    pub foreground: bool,
}

impl Location {
    /// Parses `(latitude, longitude)`.
    pub fn coordinates(&self) -> Result<(f64, f64), ParseFloatError> {
        Ok((self.latitude.trim().parse()?, self.longitude.trim().parse()?))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Custom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

/// Body of RICH_DELIVERY, RICH_READ and RICH_DELETE events.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct RichEvent {
    pub push_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct InAppMessageDisplay {
    pub push_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggering_push: Option<PushRef>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct InAppMessageExpiration {
    pub push_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Why the message expired, e.g. `REPLACED` or `EXPIRED`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub expiration_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacing_push: Option<PushRef>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct InAppMessageResolution {
    pub push_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// How the message was resolved, e.g. `BUTTON_CLICK` or `USER_DISMISSED`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resolution_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_description: Option<String>,
    /// Milliseconds the message was on screen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("wrong type for event: expected {expected}, found {actual}")]
    WrongType {
        expected: &'static str,
        actual: EventType,
    },

    #[error("failed to decode event body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BodyError {
    pub fn is_wrong_type(&self) -> bool {
        matches!(self, Self::WrongType { .. })
    }
}

mod offset_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(offset: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(offset)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Wire::deserialize(deserializer)? {
            Wire::Number(offset) => Ok(offset),
            Wire::Text(text) => text
                .parse()
                .map_err(|err| de::Error::custom(format!("invalid offset {text:?}: {err}"))),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|err| de::Error::custom(format!("invalid base64 payload: {err}")))
    }
}

/// Accepts a coordinate written either as a JSON number or a decimal string.
fn decimal_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Text(String),
        Number(serde_json::Number),
    }

    match Wire::deserialize(deserializer)? {
        Wire::Text(text) => match text.trim().parse::<f64>() {
            Ok(_) => Ok(text),
            Err(err) => Err(serde::de::Error::custom(format!(
                "invalid coordinate {text:?}: {err}"
            ))),
        },
        Wire::Number(number) => Ok(number.to_string()),
    }
}
