//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The platform is not running or not reachable.
    #[error("Sandbox platform is not available: {message}")]
    PlatformUnavailable { message: String },

    /// Container image could not be found or pulled.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// Sandbox lifecycle operation failed (create, start, terminate).
    #[error("Sandbox operation failed: {message}")]
    SandboxFailed { message: String },

    /// Running a command inside the sandbox failed.
    #[error("Command execution failed: {message}")]
    ExecFailed { message: String },

    /// The channel to a remote platform could not be opened.
    #[error("Platform channel failed: {message}")]
    ChannelFailed { message: String },
}

impl SandboxError {
    /// Creates a `PlatformUnavailable` error.
    pub fn platform_unavailable(message: impl Into<String>) -> Self {
        Self::PlatformUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `SandboxFailed` error.
    pub fn sandbox_failed(message: impl Into<String>) -> Self {
        Self::SandboxFailed {
            message: message.into(),
        }
    }

    /// Creates an `ExecFailed` error.
    pub fn exec_failed(message: impl Into<String>) -> Self {
        Self::ExecFailed {
            message: message.into(),
        }
    }

    /// Creates a `ChannelFailed` error.
    pub fn channel_failed(message: impl Into<String>) -> Self {
        Self::ChannelFailed {
            message: message.into(),
        }
    }

    /// Returns true if the platform itself could not be reached.
    pub fn is_platform_unavailable(&self) -> bool {
        matches!(self, Self::PlatformUnavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }

    /// Returns true if the transport to the platform failed.
    pub fn is_channel_failed(&self) -> bool {
        matches!(self, Self::ChannelFailed { .. })
    }
}
