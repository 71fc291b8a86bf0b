use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{AuthzError, AuthzResult, PermissionMatcher, User};

/// A user record bound to its compiled matcher.
#[derive(Debug)]
pub struct ResolvedUser {
    user: User,
    matcher: PermissionMatcher,
}

impl ResolvedUser {
    pub fn new(user: &User) -> Self {
        let user = user.clone();
        let matcher = match &user.permissions {
            Some(permissions) => PermissionMatcher::new(permissions),
            None => PermissionMatcher::unrestricted(),
        };
        Self { user, matcher }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn matcher(&self) -> &PermissionMatcher {
        &self.matcher
    }

    pub fn password_matches(&self, password: &str) -> bool {
        self.user.password == password
    }
}

type UserMap = HashMap<String, Arc<ResolvedUser>>;

/// Read-mostly set of configured users.
///
/// Lookups read the current snapshot without locking. `reload` builds a new
/// map from deep copies and swaps it in, so connections keep the records they
/// resolved at authentication time.
#[derive(Debug, Default)]
pub struct UserStore {
    users: ArcSwap<UserMap>,
}

impl UserStore {
    pub fn new(users: &[User]) -> AuthzResult<Self> {
        let store = Self::default();
        store.reload(users)?;
        Ok(store)
    }

    pub fn reload(&self, users: &[User]) -> AuthzResult<()> {
        let mut next = UserMap::with_capacity(users.len());
        for user in users {
            user.validate()?;
            if next.contains_key(&user.username) {
                return Err(AuthzError::DuplicateUser(user.username.clone()));
            }
            next.insert(user.username.clone(), Arc::new(ResolvedUser::new(user)));
        }
        self.users.store(Arc::new(next));
        Ok(())
    }

    pub fn lookup(&self, username: &str) -> Option<Arc<ResolvedUser>> {
        self.users.load().get(username).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, Permissions};

    fn ivan(publish: &str) -> User {
        User::new("ivan", "pwd").with_permissions(Permissions {
            publish: Some(vec![publish.to_string()]),
            subscribe: Some(vec!["bar".to_string()]),
        })
    }

    #[test]
    fn lookup_resolves_matcher() {
        let store = UserStore::new(&[ivan("foo")]).expect("store");
        let user = store.lookup("ivan").expect("ivan");
        assert!(user.password_matches("pwd"));
        assert!(user.matcher().allows(Action::Publish, "foo"));
        assert!(!user.matcher().allows(Action::Subscribe, "foo"));
        assert!(store.lookup("nobody").is_none());
    }

    #[test]
    fn reload_does_not_touch_held_records() {
        let store = UserStore::new(&[ivan("foo")]).expect("store");
        let held = store.lookup("ivan").expect("ivan");

        store.reload(&[ivan("baz")]).expect("reload");

        assert!(held.matcher().allows(Action::Publish, "foo"));
        assert!(!held.matcher().allows(Action::Publish, "baz"));
        let fresh = store.lookup("ivan").expect("ivan");
        assert!(fresh.matcher().allows(Action::Publish, "baz"));
        assert!(!fresh.matcher().allows(Action::Publish, "foo"));
    }

    #[test]
    fn reload_copies_input_records() {
        let mut users = vec![ivan("foo")];
        let store = UserStore::new(&users).expect("store");
        if let Some(perms) = users[0].permissions.as_mut() {
            perms.publish = Some(Vec::new());
        }
        let resolved = store.lookup("ivan").expect("ivan");
        assert_eq!(
            resolved.user().permissions.as_ref().and_then(|p| p.publish.clone()),
            Some(vec!["foo".to_string()])
        );
    }

    #[test]
    fn reload_rejects_duplicates_and_keeps_previous_set() {
        let store = UserStore::new(&[ivan("foo")]).expect("store");
        let err = store
            .reload(&[User::new("a", "1"), User::new("a", "2")])
            .expect_err("duplicate");
        assert!(matches!(err, AuthzError::DuplicateUser(name) if name == "a"));
        assert!(store.lookup("ivan").is_some());
        assert_eq!(store.len(), 1);
    }
}
