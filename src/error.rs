// ============================================================================
// ERRORS: taxonomy shared by every layer of the engine
// ============================================================================

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Bad dimensions, unknown texture kind, malformed input. The operation
    /// that returned it did nothing.
    #[error("validation error: {0}")]
    Validation(String),

    /// Surface allocation failed. The current stroke is aborted and the last
    /// committed state is kept.
    #[error("compositing failure: {0}")]
    Compositing(String),

    /// The adjustment program could not be created. Display falls back to the
    /// uncorrected preview.
    #[error("shader init failure: {0}")]
    ShaderInit(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A snapshot could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn compositing(msg: impl Into<String>) -> Self {
        Self::Compositing(msg.into())
    }

    pub fn shader_init(msg: impl Into<String>) -> Self {
        Self::ShaderInit(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// True for errors the user should see as a non-fatal notice rather than
    /// a programming mistake.
    pub fn is_user_notice(&self) -> bool {
        matches!(self, Self::Compositing(_) | Self::Persistence(_))
    }
}

impl From<Box<bincode::ErrorKind>> for EngineError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        Self::Serialize(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e.to_string())
    }
}

impl From<image::ImageError> for EngineError {
    fn from(e: image::ImageError) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(EngineError::validation("x").to_string().starts_with("validation error:"));
        assert!(EngineError::compositing("x").to_string().starts_with("compositing failure:"));
        assert!(EngineError::shader_init("x").to_string().starts_with("shader init failure:"));
        assert!(EngineError::persistence("x").to_string().starts_with("persistence failure:"));
        assert!(EngineError::codec("x").to_string().starts_with("codec error:"));
    }

    #[test]
    fn only_runtime_failures_are_user_notices() {
        assert!(EngineError::compositing("oom").is_user_notice());
        assert!(EngineError::persistence("offline").is_user_notice());
        assert!(!EngineError::validation("zero width").is_user_notice());
    }
}
