use thiserror::Error;

/// Engine-wide error type.
///
/// Mutating operations return these to the caller and never partially apply;
/// the numeric codes are part of the request/reply surface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("JSON error: {0}")]
    Json(String),

    #[error("rule '{0}' already exists")]
    Duplicate(String),

    #[error("rule name '{0}' already taken")]
    NameConflict(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("bad alert status: {0}")]
    BadStatus(String),

    #[error("expression error: {0}")]
    Script(String),

    #[error("semantic error: {0}")]
    Semantic(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("rule rejected for this asset family: {0}")]
    RejectedBySuitability(String, i32),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl EngineError {
    /// User-visible result code carried in request/reply error responses.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::Json(_) | EngineError::Semantic(_) => -1,
            EngineError::Duplicate(_) => -2,
            EngineError::NameConflict(_) => -3,
            EngineError::NotFound(_) => -4,
            EngineError::BadStatus(_) | EngineError::Script(_) => -5,
            EngineError::Persistence(_) => -6,
            EngineError::RejectedBySuitability(_, code) => *code,
            EngineError::Evaluation(_) | EngineError::Transport(_) => -1,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Json(e.to_string())
    }
}
