use thiserror::Error;

#[derive(Debug, Error)]
pub enum FwupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("unsafe operation blocked: {0}")]
    Safety(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unknown requirement: {0}")]
    UnknownRequirement(String),

    #[error("no applicable task found for '{0}'")]
    NoApplicableTask(String),

    #[error("evaluator error: {0}")]
    Eval(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("fat filesystem error: {0}")]
    Fat(String),
}

pub type Result<T> = std::result::Result<T, FwupError>;
