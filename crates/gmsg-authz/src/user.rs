use serde::{Deserialize, Serialize};

use crate::{AuthzError, AuthzResult};

/// Allow-lists of subject patterns.
///
/// `None` leaves the action unrestricted. `Some(vec![])` denies it entirely.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub publish: Option<Vec<String>>,
    #[serde(default)]
    pub subscribe: Option<Vec<String>>,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

// Field-by-field copies keep absent lists absent and empty lists empty.
impl Clone for Permissions {
    fn clone(&self) -> Self {
        Self {
            publish: self.publish.as_ref().map(|list| list.to_vec()),
            subscribe: self.subscribe.as_ref().map(|list| list.to_vec()),
        }
    }
}

impl Clone for User {
    fn clone(&self) -> Self {
        Self {
            username: self.username.clone(),
            password: self.password.clone(),
            permissions: self.permissions.as_ref().map(Permissions::clone),
        }
    }
}

/// Deep copy of an optional user. A missing user stays missing.
pub fn clone_user(user: Option<&User>) -> Option<User> {
    user.map(User::clone)
}

impl Permissions {
    pub fn validate(&self) -> AuthzResult<()> {
        let lists = [&self.publish, &self.subscribe];
        for pattern in lists.into_iter().flatten().flatten() {
            gmsg_wire::subject::validate_pattern(pattern)
                .map_err(|_| AuthzError::InvalidPattern(pattern.clone()))?;
        }
        Ok(())
    }
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn validate(&self) -> AuthzResult<()> {
        match &self.permissions {
            Some(permissions) => permissions.validate(),
            None => Ok(()),
        }
    }
}
