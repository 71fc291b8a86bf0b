use thiserror::Error;

use crate::Action;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("invalid permission pattern {0:?}")]
    InvalidPattern(String),
    #[error("duplicate user {0:?}")]
    DuplicateUser(String),
    #[error("Permissions Violation for {action} to \"{subject}\"")]
    Denied { action: Action, subject: String },
}

pub type AuthzResult<T> = Result<T, AuthzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_variants() {
        let errors = vec![
            AuthzError::InvalidPattern("foo.>.bar".to_string()),
            AuthzError::DuplicateUser("ivan".to_string()),
            AuthzError::Denied {
                action: Action::Publish,
                subject: "bar".to_string(),
            },
        ];

        for error in errors {
            let rendered = error.to_string();
            assert!(!rendered.is_empty());
        }
    }

    #[test]
    fn denied_names_action_and_subject() {
        let rendered = AuthzError::Denied {
            action: Action::Subscribe,
            subject: "foo".to_string(),
        }
        .to_string();
        assert_eq!(rendered, "Permissions Violation for Subscription to \"foo\"");
    }
}
