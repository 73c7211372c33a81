//! Wire envelopes exchanged between the host and the sandbox.
//!
//! Every message is a UTF-8 JSON object with a `type` field. Each direction
//! has its own closed set of kinds; anything else is rejected at decode time
//! and never reaches business logic.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("message has no `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode `{kind}` message: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A closed family of envelopes travelling in one direction.
pub trait Message: Serialize + DeserializeOwned + std::fmt::Debug + Send + 'static {
    const KINDS: &'static [&'static str];

    fn kind(&self) -> &'static str;
}

pub fn encode<M: Message>(message: &M) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|source| ProtocolError::Encode {
        kind: message.kind(),
        source,
    })
}

pub fn decode<M: Message>(raw: &str) -> Result<M, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(ProtocolError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();
    if !M::KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownMessageType(kind));
    }
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NavigationAction {
    GoToPage,
    GoToNextPage,
    GoToPreviousPage,
}

impl NavigationAction {
    pub const ALL: [NavigationAction; 3] = [
        NavigationAction::GoToPage,
        NavigationAction::GoToNextPage,
        NavigationAction::GoToPreviousPage,
    ];

    /// Name of the direct entry point, defined once the document is loaded.
    pub const fn entry_point(self) -> &'static str {
        match self {
            NavigationAction::GoToPage => "goToPage",
            NavigationAction::GoToNextPage => "goToNextPage",
            NavigationAction::GoToPreviousPage => "goToPreviousPage",
        }
    }

    /// Name of the prefixed entry point, defined as soon as the sandbox starts.
    pub const fn fallback_entry_point(self) -> &'static str {
        match self {
            NavigationAction::GoToPage => "pdfViewerGoToPage",
            NavigationAction::GoToNextPage => "pdfViewerGoToNextPage",
            NavigationAction::GoToPreviousPage => "pdfViewerGoToPreviousPage",
        }
    }

    pub fn from_entry_point(name: &str) -> Option<NavigationAction> {
        Self::ALL
            .into_iter()
            .find(|action| action.entry_point() == name || action.fallback_entry_point() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationCommand {
    pub action: NavigationAction,
    #[serde(
        rename = "pageNumber",
        default,
        deserialize_with = "whole_page_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub page_number: Option<i64>,
}

/// Largest integer an f64 holds exactly.
const MAX_EXACT_PAGE: f64 = 9_007_199_254_740_992.0;

/// JavaScript hosts send every number as a double, so `3.0` is a page.
fn whole_page_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(value) = Option::<f64>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if !value.is_finite() || value.fract() != 0.0 || value.abs() > MAX_EXACT_PAGE {
        return Err(D::Error::custom(format!(
            "pageNumber must be a whole number, got {value}"
        )));
    }
    Ok(Some(value as i64))
}

impl NavigationCommand {
    pub fn go_to_page(page_number: i64) -> Self {
        Self {
            action: NavigationAction::GoToPage,
            page_number: Some(page_number),
        }
    }

    pub fn next_page() -> Self {
        Self {
            action: NavigationAction::GoToNextPage,
            page_number: None,
        }
    }

    pub fn previous_page() -> Self {
        Self {
            action: NavigationAction::GoToPreviousPage,
            page_number: None,
        }
    }
}

/// Host → sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Command(NavigationCommand),
    LoadDataUri {
        #[serde(rename = "dataUri")]
        data_uri: String,
    },
    LoadUrl {
        url: String,
    },
}

impl Message for HostMessage {
    const KINDS: &'static [&'static str] = &["command", "loadDataUri", "loadUrl"];

    fn kind(&self) -> &'static str {
        match self {
            HostMessage::Command(_) => "command",
            HostMessage::LoadDataUri { .. } => "loadDataUri",
            HostMessage::LoadUrl { .. } => "loadUrl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Error,
}

/// Sandbox → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SandboxEvent {
    Loaded {
        #[serde(rename = "pageCount")]
        page_count: u32,
        #[serde(rename = "currentPage")]
        current_page: u32,
    },
    PageChanged {
        #[serde(rename = "currentPage")]
        current_page: u32,
    },
    Error {
        message: String,
    },
    Console {
        level: ConsoleLevel,
        message: String,
    },
    TextSelected {
        #[serde(rename = "selectedText")]
        selected_text: String,
    },
}

impl Message for SandboxEvent {
    const KINDS: &'static [&'static str] =
        &["loaded", "pageChanged", "error", "console", "textSelected"];

    fn kind(&self) -> &'static str {
        match self {
            SandboxEvent::Loaded { .. } => "loaded",
            SandboxEvent::PageChanged { .. } => "pageChanged",
            SandboxEvent::Error { .. } => "error",
            SandboxEvent::Console { .. } => "console",
            SandboxEvent::TextSelected { .. } => "textSelected",
        }
    }
}
