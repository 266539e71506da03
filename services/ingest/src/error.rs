use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Workbook error: {0}")]
    Calamine(#[from] calamine::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    /// Unresolvable structure in a sheet. Fatal to that sheet only.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Profile error: {0}")]
    Profile(String),

    /// Unreadable or corrupt input file. Fatal to the whole batch.
    #[error("Unreadable workbook: {0}")]
    Workbook(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No open sheet transaction")]
    NoTransaction,
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::Config(msg.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, PipelineError::Config(_))
    }

    /// Errors that abort the whole file rather than a single sheet.
    pub fn is_fatal_input(&self) -> bool {
        matches!(self, PipelineError::Workbook(_) | PipelineError::Calamine(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
