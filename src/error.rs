use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    /// A required derived value (identifier, lab, fixity) could not be computed.
    #[error("catalog data error: {0}")]
    Data(String),

    #[error("file update failed: {0}")]
    FileUpdateFailure(String),

    #[error("sample update failed: {0}")]
    SampleUpdateFailure(String),

    #[error("measurement update failed: {0}")]
    MeasurementUpdateFailure(String),

    #[error("catalog database error: {0}")]
    Database(String),

    #[error("catalog query error: {0}")]
    Query(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("missing config file datacatalog.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

impl CatalogError {
    pub fn is_update_failure(&self) -> bool {
        matches!(
            self,
            CatalogError::FileUpdateFailure(_)
                | CatalogError::SampleUpdateFailure(_)
                | CatalogError::MeasurementUpdateFailure(_)
        )
    }
}
