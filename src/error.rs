use thiserror::Error;

/// Wire-level error categories surfaced to git clients as
/// `ng <reference> <category>[: <detail>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    ReadOnly,
    InvalidRef,
    Forbidden,
    RestrictedRef,
    DeleteUnallowed,
    PublishedMustPointToCommitInMaster,
    ProblemBadLayout,
    ReviewBadLayout,
    ConfigBadLayout,
    ConfigInvalidPublishingMode,
    ConfigRepositoryNotAbsoluteUrl,
    ConfigSubdirectoryMissingTarget,
    JsonParseError,
    TooManyObjectsInPackfile,
    TooBig,
    InteractiveBadLayout,
    InteractiveCompileError,
    InteractiveCompileTimeout,
    InternalGit,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::InvalidRef => "invalid-ref",
            Self::Forbidden => "forbidden",
            Self::RestrictedRef => "restricted-ref",
            Self::DeleteUnallowed => "delete-unallowed",
            Self::PublishedMustPointToCommitInMaster => {
                "published-must-point-to-commit-in-master"
            }
            Self::ProblemBadLayout => "problem-bad-layout",
            Self::ReviewBadLayout => "review-bad-layout",
            Self::ConfigBadLayout => "config-bad-layout",
            Self::ConfigInvalidPublishingMode => "config-invalid-publishing-mode",
            Self::ConfigRepositoryNotAbsoluteUrl => "config-repository-not-absolute-url",
            Self::ConfigSubdirectoryMissingTarget => "config-subdirectory-missing-target",
            Self::JsonParseError => "json-parse-error",
            Self::TooManyObjectsInPackfile => "too-many-objects-in-packfile",
            Self::TooBig => "too-big",
            Self::InteractiveBadLayout => "interactive-bad-layout",
            Self::InteractiveCompileError => "interactive-compile-error",
            Self::InteractiveCompileTimeout => "interactive-compile-timeout",
            Self::InternalGit => "internal-git",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal-git: {0}")]
    Git(#[from] git2::Error),

    #[error("{category}{}", detail.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
    Categorized {
        category: ErrorCategory,
        detail: Option<String>,
    },

    /// Out-of-band failure: the whole push reports `unpack <reason>` and no
    /// per-reference status lines.
    #[error("{0}")]
    Unpack(String),
}

impl Error {
    #[must_use]
    pub fn categorized(category: ErrorCategory) -> Self {
        Self::Categorized {
            category,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(category: ErrorCategory, detail: impl Into<String>) -> Self {
        Self::Categorized {
            category,
            detail: Some(detail.into()),
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Categorized { category, .. } => *category,
            _ => ErrorCategory::InternalGit,
        }
    }

    /// Reason string used on the `ng <ref> <reason>` wire line.
    #[must_use]
    pub fn wire_reason(&self) -> String {
        match self {
            Self::Categorized {
                category,
                detail: Some(detail),
            } => format!("{category}: {detail}"),
            Self::Categorized { category, .. } => category.as_str().to_string(),
            Self::Git(err) => format!("internal-git: {}", err.message()),
            Self::Io(err) => format!("internal-git: {err}"),
            Self::Unpack(reason) => reason.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_reason() {
        assert_eq!(
            Error::categorized(ErrorCategory::InvalidRef).wire_reason(),
            "invalid-ref"
        );
        assert_eq!(
            Error::with_detail(ErrorCategory::ReviewBadLayout, "missing ledger file")
                .wire_reason(),
            "review-bad-layout: missing ledger file"
        );
    }
}
