//! Wire JSON for the /Discover, /Ask and /Upload endpoints
//!
//! Apple peers are not consistent about key casing, so request bodies are
//! accepted with any casing: incoming object keys are folded to lowercase
//! before deserialization. Everything we emit uses PascalCase keys.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AirDropError, Result};

/// Deserialize a request body with case-insensitive keys.
///
/// Object keys are folded to lowercase at every nesting level, then matched
/// against the lowercase field names of `T`.
pub fn from_slice_ci<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| AirDropError::ProtocolViolation(format!("malformed JSON: {e}")))?;
    serde_json::from_value(fold_keys(value))
        .map_err(|e| AirDropError::ProtocolViolation(format!("unexpected JSON shape: {e}")))
}

fn fold_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), fold_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(fold_keys).collect()),
        other => other,
    }
}

/// Body of `POST /Discover`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct DiscoverRequest {
    pub sender_computer_name: String,
    #[serde(default)]
    pub sender_model_name: String,
    #[serde(default)]
    pub sender_id: String,
}

/// Media kinds the receiver is willing to take
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MediaCapabilities {
    pub files: bool,
    pub photos: bool,
    pub videos: bool,
    pub contacts: bool,
    pub urls: bool,
}

impl Default for MediaCapabilities {
    fn default() -> Self {
        Self {
            files: true,
            photos: true,
            videos: true,
            // Contact cards need address-book integration we don't do
            contacts: false,
            urls: true,
        }
    }
}

/// Response to `POST /Discover`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub receiver_computer_name: String,
    pub receiver_model_name: String,
    pub receiver_media_capabilities: MediaCapabilities,
}

/// One file announced in `POST /Ask`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct AskFileEntry {
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_is_directory: bool,
}

/// Body of `POST /Ask`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct AskRequest {
    pub sender_computer_name: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub files: Vec<AskFileEntry>,
}

/// Response to `POST /Ask`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AskResponse {
    pub receiver_computer_name: String,
    pub receiver_model_name: String,
}

/// Response to `POST /Upload`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadResponse {
    pub success: bool,
    pub files_received: usize,
    pub message: String,
}

/// PascalCase variants used when the client builds request bodies.
///
/// We emit the same casing Apple's sender does so a conforming receiver
/// never needs the case folding we apply ourselves.
pub mod outgoing {
    use super::AskFileEntry;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct DiscoverRequest {
        pub sender_computer_name: String,
        pub sender_model_name: String,
        #[serde(rename = "SenderID")]
        pub sender_id: String,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct AskRequest {
        pub sender_computer_name: String,
        #[serde(rename = "SenderID")]
        pub sender_id: String,
        pub files: Vec<OutgoingFileEntry>,
    }

    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct OutgoingFileEntry {
        pub file_name: String,
        pub file_size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub file_type: Option<String>,
        pub file_is_directory: bool,
    }

    impl From<&AskFileEntry> for OutgoingFileEntry {
        fn from(entry: &AskFileEntry) -> Self {
            Self {
                file_name: entry.file_name.clone(),
                file_size: entry.file_size,
                file_type: entry.file_type.clone(),
                file_is_directory: entry.file_is_directory,
            }
        }
    }
}
