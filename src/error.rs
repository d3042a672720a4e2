use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PortalError {
    #[error("invalid modality: {0}")]
    InvalidModality(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid merge strategy: {0}")]
    InvalidStrategy(String),

    #[error("invalid project selection: {0}")]
    InvalidSelection(String),

    #[error("no downloadable file matches {0}")]
    #[diagnostic(help("change the format, merge, or multiplexed options"))]
    NoMatchingFile(String),

    #[error("catalog contains {count} files matching {tuple}")]
    #[diagnostic(code(portal::catalog::ambiguous))]
    AmbiguousCatalogEntry { tuple: String, count: usize },

    #[error("cannot append a {incoming} dataset to a {target} dataset")]
    #[diagnostic(help("replace the existing dataset or cancel"))]
    MergeConflict { target: String, incoming: String },

    #[error("{message} (status {status})")]
    RemoteRequestFailed { status: u16, message: String },

    #[error("portal request failed: {0}")]
    RemoteHttp(String),

    #[error("dataset {0} did not finish processing within the polling limit")]
    PollingExhausted(String),

    #[error("polling for dataset {0} was cancelled")]
    PollingCancelled(String),

    #[error("dataset {0} is processing and cannot be modified")]
    DatasetLocked(String),

    #[error("dataset has no projects selected")]
    EmptyDataset,

    #[error("dataset has not been saved to the portal")]
    UnsavedDataset,

    #[error("dataset {0} is not ready for download")]
    DatasetNotReady(String),

    #[error("dataset {0} has not expired and cannot be regenerated")]
    NotExpired(String),

    #[error("an email address is required before processing a dataset")]
    MissingEmail,

    #[error("the terms of use must be accepted before processing a dataset")]
    TermsNotAccepted,

    #[error("download selection changed while the request was in flight")]
    StaleSelection,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read catalog: {0}")]
    CatalogRead(String),

    #[error("local state error: {0}")]
    Storage(String),
}

impl PortalError {
    /// Builds a `RemoteRequestFailed` carrying the user-facing message for `status`.
    pub fn remote(status: u16) -> Self {
        PortalError::RemoteRequestFailed {
            status,
            message: remote_message(status).to_string(),
        }
    }

    pub fn is_user_recoverable(&self) -> bool {
        !matches!(self, PortalError::AmbiguousCatalogEntry { .. })
    }
}

pub fn remote_message(status: u16) -> &'static str {
    match status {
        400 => "The request was rejected by the portal. Check your selection and try again.",
        401 | 403 => "You are not authorized to perform this action. Accept the terms of use and try again.",
        404 => "The requested dataset could not be found.",
        409 => "The dataset was changed elsewhere. Reload it and try again.",
        429 => "Too many requests. Wait a moment and try again.",
        500..=599 => "The portal is unavailable right now. Try again later.",
        _ => "Something went wrong. Try again later.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_status_codes_have_specific_messages() {
        assert_ne!(remote_message(404), remote_message(418));
        assert_eq!(remote_message(401), remote_message(403));
        assert_eq!(remote_message(502), remote_message(503));
    }

    #[test]
    fn unknown_status_falls_back_to_generic_message() {
        let err = PortalError::remote(418);
        assert_eq!(err.to_string(), "Something went wrong. Try again later. (status 418)");
    }

    #[test]
    fn ambiguous_catalog_is_not_recoverable() {
        let err = PortalError::AmbiguousCatalogEntry {
            tuple: "x".to_string(),
            count: 2,
        };
        assert!(!err.is_user_recoverable());
        assert!(PortalError::NoMatchingFile("x".to_string()).is_user_recoverable());
    }
}
