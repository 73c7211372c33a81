//! The sandbox side of pagebridge: everything that runs next to the
//! rendering surface and talks to the host only through messages.

pub mod commands;
pub mod gesture;
pub mod loader;
#[cfg(feature = "pdf")]
pub mod pdfium;
pub mod sandbox;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod testing;

pub use commands::CommandTable;
pub use gesture::{GestureController, GestureIntent, PointerEvent};
pub use loader::{LoadError, LoadRequest, PDF_DATA_URI_PREFIX};
#[cfg(feature = "pdf")]
pub use pdfium::PdfiumProvider;
pub use sandbox::{Sandbox, SandboxHandle, SandboxInput};
pub use scheduler::{JobId, RenderError, RenderJob, RenderScheduler, RequestOutcome};
pub use session::{Frame, SandboxSession};
