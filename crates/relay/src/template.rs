//! The template render contract.
//!
//! Rendering engines live outside the engine core. Render failures are
//! terminal: a payload that cannot be produced now will not be producible
//! on a retry, so the dispatcher records them as failed without retrying.

use std::collections::HashMap;

use thiserror::Error;

/// Why a payload could not be rendered.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// No template registered under the requested id.
    #[error("template not found: {0}")]
    NotFound(String),
    /// The template exists but the context is incomplete or invalid.
    #[error("template render failed: {0}")]
    Render(String),
}

/// Produces the human-readable payload for a channel.
pub trait TemplateEngine: Send + Sync {
    fn render(
        &self,
        template_id: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> std::result::Result<String, TemplateError>;
}
