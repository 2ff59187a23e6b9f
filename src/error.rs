use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuditError {
    #[error("invalid temporal range: {0}")]
    InvalidTemporalRange(String),

    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    #[error("unknown product type: {0}")]
    InvalidProductType(String),

    #[error("invalid collection concept id: {0}")]
    InvalidCollectionId(String),

    #[error("invalid granule concept id: {0:?}")]
    InvalidConceptId(String),

    #[error("invalid aggregation period: {0}")]
    InvalidPeriod(String),

    #[error("unknown venue: {0}")]
    InvalidVenue(String),

    #[error("invalid time span threshold {0}: must be a non-negative number of minutes")]
    InvalidTimeSpan(f64),

    #[error("invalid page size {0}: must be between 1 and 2000")]
    InvalidPageSize(usize),

    #[error("no collection configured for {product} in {venue}")]
    MissingCollection { product: String, venue: String },

    #[error("missing config file: {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("CMR request failed: {0}")]
    CmrHttp(String),

    #[error("CMR returned status {status} for {endpoint}: {message}")]
    CmrStatus {
        status: u16,
        endpoint: String,
        message: String,
    },

    #[error("CMR request to {endpoint} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: usize,
        last_error: String,
    },

    #[error("unexpected CMR response from {endpoint}: {message}")]
    CmrDecode { endpoint: String, message: String },
}

impl AuditError {
    /// True when the request itself is wrong and repeating it cannot help.
    pub fn is_caller_error(&self) -> bool {
        match self {
            AuditError::InvalidTemporalRange(_)
            | AuditError::InvalidBoundingBox(_)
            | AuditError::InvalidProductType(_)
            | AuditError::InvalidCollectionId(_)
            | AuditError::InvalidConceptId(_)
            | AuditError::InvalidPeriod(_)
            | AuditError::InvalidVenue(_)
            | AuditError::InvalidPageSize(_)
            | AuditError::InvalidTimeSpan(_)
            | AuditError::MissingCollection { .. } => true,
            AuditError::CmrStatus { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }

    /// True when the metadata service could not be reached or kept failing.
    pub fn is_service_error(&self) -> bool {
        matches!(
            self,
            AuditError::CmrHttp(_) | AuditError::RetriesExhausted { .. }
        ) || matches!(self, AuditError::CmrStatus { status, .. } if *status >= 500)
    }
}
