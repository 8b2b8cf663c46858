use thiserror::Error;

use crate::ClusterId;

const RETRY_MESSAGE: &str = "could not analyze this submission, try again or provide more detail";

/// Failure taxonomy shared by every analysis component.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("unrecognized job url {url}: {reason}")]
    UnrecognizedUrl { url: String, reason: String },
    #[error("incomplete posting, missing {}", fields.join(", "))]
    IncompleteInput { fields: Vec<String> },
    #[error("identity race resolved in favour of cluster {cluster}")]
    IdentityConflict { cluster: ClusterId },
    #[error("{dependency} unavailable: {reason}")]
    DependencyUnavailable { dependency: String, reason: String },
    #[error("malformed correction: {reason}")]
    MalformedCorrection { reason: String },
}

impl AnalysisError {
    pub fn dependency(dependency: impl Into<String>, reason: impl ToString) -> Self {
        Self::DependencyUnavailable {
            dependency: dependency.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCorrection {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same submission later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DependencyUnavailable { .. } | Self::IdentityConflict { .. })
    }

    /// Text safe to show at the boundary; never leaks internal detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnrecognizedUrl { .. } | Self::DependencyUnavailable { .. } => {
                RETRY_MESSAGE.to_string()
            }
            Self::IncompleteInput { fields } => format!(
                "the posting is missing {}; results may be less reliable",
                fields.join(", ")
            ),
            Self::IdentityConflict { .. } => "this posting was already analyzed".to_string(),
            Self::MalformedCorrection { .. } => "the correction could not be applied".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_messages_hide_internals() {
        let err = AnalysisError::dependency("fingerprint-store", "deadline of 2000ms elapsed");
        assert!(err.is_recoverable());
        assert!(!err.user_message().contains("2000ms"));
        let err = AnalysisError::UnrecognizedUrl {
            url: "https://example.com".into(),
            reason: "no tier matched".into(),
        };
        assert_eq!(err.user_message(), RETRY_MESSAGE);
        assert!(err.to_string().contains("no tier matched"));
    }
}
