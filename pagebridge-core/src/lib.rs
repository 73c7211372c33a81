use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;
pub mod protocol;
pub mod transport;
pub mod viewport;

pub use config::{BridgeConfig, ConfigError, GestureConfig, LayoutConfig, ViewerConfig, ZoomConfig};
pub use protocol::{
    ConsoleLevel, HostMessage, Message, NavigationAction, NavigationCommand, ProtocolError,
    SandboxEvent,
};
pub use transport::{Channel, Delivery, Inbox, Outbox, TransportClosed, TransportEndpoint};
pub use viewport::{
    fit_to_width, hit_test, to_render_pixels, Affine, PageGeometry, Point, Rect, TextLayerItem,
    ViewportState, ZoomDirection, ZoomLimits,
};

pub type DocumentId = Uuid;

/// Intrinsic page size in document units (scale 1.0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub label: String,
    pub page_count: usize,
    pub title: Option<String>,
}

/// Sandbox-owned reference to the loaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentHandle {
    pub id: DocumentId,
    pub total_pages: u32,
    pub is_loaded: bool,
}

impl DocumentHandle {
    pub fn from_info(info: &DocumentInfo) -> Self {
        Self {
            id: info.id,
            total_pages: u32::try_from(info.page_count).unwrap_or(u32::MAX),
            is_loaded: true,
        }
    }

    pub fn contains(&self, page: i64) -> bool {
        page >= 1 && page <= i64::from(self.total_pages)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    /// Backing-store scale: viewport scale times device pixel ratio.
    pub scale: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A run of text as reported by the rendering library, in document space
/// with a top-left origin.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub bounds: Rect,
    pub transform: Affine,
}

/// Where a document comes from once the loader has resolved the wire request.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    Bytes { label: String, data: Vec<u8> },
    Path(PathBuf),
}

impl DocumentSource {
    pub fn label(&self) -> String {
        match self {
            DocumentSource::Bytes { label, .. } => label.clone(),
            DocumentSource::Path(path) => path.display().to_string(),
        }
    }
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn page_size(&self, page_index: usize) -> Result<PageSize>;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
    fn text_runs(&self, page_index: usize) -> Result<Vec<TextRun>>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, source: DocumentSource) -> Result<Arc<dyn DocumentBackend>>;
}

/// Failure when calling a named entry point exported by the sandbox.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("entry point `{0}` is not defined")]
    NotDefined(String),
    #[error("sandbox transport is closed")]
    Closed,
    #[error("failed to encode command: {0}")]
    Encode(String),
}

/// The host's view of the sandbox's exported functions, the equivalent of
/// injecting a script that calls a global by name.
pub trait ScriptTarget: Send + Sync {
    fn invoke(&self, entry_point: &str, page_number: Option<i64>) -> Result<(), InvokeError>;
}
