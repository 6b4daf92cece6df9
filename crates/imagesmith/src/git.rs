//! Classification of source-retrieval (git clone) failures

use std::fmt;

/// Message reported when the clone stopped at an interactive credential prompt
pub const AUTH_PROMPTED_MESSAGE: &str = "incomplete credentials, please check docs/faq";

/// Failure classes surfaced by the source step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitErrorClass {
    /// Credentials were required but none were configured
    AuthPrompted,
    AuthInvalidUserOrPass,
    AuthInvalidKey,
    RepositoryNotFound,
    RevisionNotFound,
}

const AUTH_PROMPT_MARKERS: &[&str] = &[
    "terminal prompts disabled",
    "could not read username",
    "could not read password",
];

const INVALID_USER_OR_PASS_MARKERS: &[&str] = &[
    "authentication failed for",
    "invalid username or password",
];

const INVALID_KEY_MARKERS: &[&str] = &[
    "permission denied (publickey)",
    "error in libcrypto",
];

/// ssh reports an unreadable key as `Load key "<path>": invalid format`
fn unreadable_key(output: &str) -> bool {
    output
        .lines()
        .any(|line| line.contains("load key") && line.contains("invalid format"))
}

const REPOSITORY_NOT_FOUND_MARKERS: &[&str] = &[
    "repository not found",
    "does not appear to be a git repository",
];

const REVISION_NOT_FOUND_MARKERS: &[&str] = &[
    "couldn't find remote ref",
    "did not match any file(s) known to git",
    "not found in upstream origin",
];

impl GitErrorClass {
    /// Token written to `FailureDetails.reason`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthPrompted => "AuthPrompted",
            Self::AuthInvalidUserOrPass => "AuthInvalidUserOrPass",
            Self::AuthInvalidKey => "AuthInvalidKey",
            Self::RepositoryNotFound => "RepositoryNotFound",
            Self::RevisionNotFound => "RevisionNotFound",
        }
    }

    /// User-facing explanation written to `FailureDetails.message`
    #[must_use]
    pub fn to_message(self) -> &'static str {
        match self {
            Self::AuthPrompted => AUTH_PROMPTED_MESSAGE,
            Self::AuthInvalidUserOrPass => {
                "Basic authentication has failed. Check the username and password or token in the clone secret."
            }
            Self::AuthInvalidKey => {
                "The SSH key in the clone secret is invalid or not authorized for the repository."
            }
            Self::RepositoryNotFound => {
                "The source repository does not exist, or you have insufficient permission to access it."
            }
            Self::RevisionNotFound => "The requested revision does not exist in the source repository.",
        }
    }

    /// True for classes whose fix is a credentials change on the user side
    #[must_use]
    pub fn is_authentication(self) -> bool {
        matches!(
            self,
            Self::AuthPrompted | Self::AuthInvalidUserOrPass | Self::AuthInvalidKey
        )
    }

    /// Parse a reason token previously written by the source step
    #[must_use]
    pub fn from_reason(reason: &str) -> Option<Self> {
        match reason {
            "AuthPrompted" => Some(Self::AuthPrompted),
            "AuthInvalidUserOrPass" => Some(Self::AuthInvalidUserOrPass),
            "AuthInvalidKey" => Some(Self::AuthInvalidKey),
            "RepositoryNotFound" => Some(Self::RepositoryNotFound),
            "RevisionNotFound" => Some(Self::RevisionNotFound),
            _ => None,
        }
    }
}

impl fmt::Display for GitErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inspect clone output for a known failure class; prompt detection takes precedence
#[must_use]
pub fn classify_clone_output(output: &str) -> Option<GitErrorClass> {
    let output = output.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|marker| output.contains(marker));

    if contains_any(AUTH_PROMPT_MARKERS) {
        Some(GitErrorClass::AuthPrompted)
    } else if contains_any(INVALID_USER_OR_PASS_MARKERS) {
        Some(GitErrorClass::AuthInvalidUserOrPass)
    } else if contains_any(INVALID_KEY_MARKERS) || unreadable_key(&output) {
        Some(GitErrorClass::AuthInvalidKey)
    } else if contains_any(REPOSITORY_NOT_FOUND_MARKERS) {
        Some(GitErrorClass::RepositoryNotFound)
    } else if contains_any(REVISION_NOT_FOUND_MARKERS) {
        Some(GitErrorClass::RevisionNotFound)
    } else {
        None
    }
}
