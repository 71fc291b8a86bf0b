use ahash::RandomState;
use gmsg_wire::subject;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{Action, AuthzError, AuthzResult, Permissions};

// Publish decisions are cached per connection; the map is reset when full.
const PUBLISH_CACHE_CAPACITY: usize = 128;

/// Compiled permission check for one authenticated connection.
#[derive(Debug)]
pub struct PermissionMatcher {
    publish: Option<Vec<String>>,
    subscribe: Option<Vec<String>>,
    publish_cache: Mutex<HashMap<String, bool, RandomState>>,
}

impl PermissionMatcher {
    pub fn new(permissions: &Permissions) -> Self {
        let permissions = permissions.clone();
        Self {
            publish: permissions.publish,
            subscribe: permissions.subscribe,
            publish_cache: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Matcher that allows everything.
    pub fn unrestricted() -> Self {
        Self::new(&Permissions::default())
    }

    pub fn allows(&self, action: Action, subject: &str) -> bool {
        match action {
            Action::Publish => {
                if let Some(allowed) = self.publish_cache.lock().get(subject) {
                    return *allowed;
                }
                let allowed = list_allows(self.publish.as_deref(), subject);
                let mut cache = self.publish_cache.lock();
                if cache.len() >= PUBLISH_CACHE_CAPACITY {
                    cache.clear();
                }
                cache.insert(subject.to_string(), allowed);
                allowed
            }
            Action::Subscribe => list_allows(self.subscribe.as_deref(), subject),
        }
    }

    /// Like [`allows`](Self::allows) but returns the violation as an error.
    pub fn check(&self, action: Action, subject: &str) -> AuthzResult<()> {
        if self.allows(action, subject) {
            Ok(())
        } else {
            Err(AuthzError::Denied {
                action,
                subject: subject.to_string(),
            })
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.publish.is_none() && self.subscribe.is_none()
    }
}

fn list_allows(patterns: Option<&[String]>, subject: &str) -> bool {
    match patterns {
        None => true,
        Some(patterns) => patterns
            .iter()
            .any(|pattern| subject::matches(pattern, subject)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(publish: Option<&[&str]>, subscribe: Option<&[&str]>) -> Permissions {
        let own = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Permissions {
            publish: publish.map(own),
            subscribe: subscribe.map(own),
        }
    }

    #[test]
    fn absent_list_is_unrestricted() {
        let matcher = PermissionMatcher::unrestricted();
        assert!(matcher.is_unrestricted());
        assert!(matcher.allows(Action::Publish, "any.subject"));
        assert!(matcher.allows(Action::Subscribe, ">"));
    }

    #[test]
    fn empty_list_denies_everything() {
        let matcher = PermissionMatcher::new(&perms(Some(&[]), Some(&[])));
        assert!(!matcher.allows(Action::Publish, "foo"));
        assert!(!matcher.allows(Action::Subscribe, "foo"));
    }

    #[test]
    fn publish_and_subscribe_lists_are_separate() {
        let matcher = PermissionMatcher::new(&perms(Some(&["foo"]), Some(&["bar"])));
        assert!(matcher.allows(Action::Publish, "foo"));
        assert!(!matcher.allows(Action::Publish, "bar"));
        assert!(matcher.allows(Action::Subscribe, "bar"));
        assert!(!matcher.allows(Action::Subscribe, "foo"));
    }

    #[test]
    fn wildcard_permissions() {
        let matcher = PermissionMatcher::new(&perms(Some(&["orders.*"]), Some(&["events.>"])));
        assert!(matcher.allows(Action::Publish, "orders.eu"));
        assert!(!matcher.allows(Action::Publish, "orders.eu.late"));
        assert!(matcher.allows(Action::Subscribe, "events.a.b"));
        assert!(matcher.allows(Action::Subscribe, "events.*"));
        assert!(!matcher.allows(Action::Subscribe, ">"));
    }

    #[test]
    fn subscribe_cannot_widen_a_partial_wildcard() {
        let matcher = PermissionMatcher::new(&perms(None, Some(&["foo.*", "*"])));
        assert!(matcher.allows(Action::Subscribe, "foo.bar"));
        assert!(matcher.allows(Action::Subscribe, "foo.*"));
        assert!(matcher.allows(Action::Subscribe, "*"));
        assert!(!matcher.allows(Action::Subscribe, "foo.>"));
        assert!(!matcher.allows(Action::Subscribe, ">"));
        assert!(matcher.check(Action::Subscribe, "foo.>").is_err());
    }

    #[test]
    fn cached_publish_decisions_stay_correct() {
        let matcher = PermissionMatcher::new(&perms(Some(&["foo"]), None));
        for _ in 0..3 {
            assert!(matcher.allows(Action::Publish, "foo"));
            assert!(!matcher.allows(Action::Publish, "bar"));
        }
        for idx in 0..(PUBLISH_CACHE_CAPACITY * 2) {
            assert!(!matcher.allows(Action::Publish, &format!("s.{idx}")));
        }
        assert!(matcher.allows(Action::Publish, "foo"));
    }

    #[test]
    fn check_reports_violation() {
        let matcher = PermissionMatcher::new(&perms(Some(&["foo"]), None));
        let err = matcher.check(Action::Publish, "bar").expect_err("denied");
        assert!(err.to_string().to_lowercase().contains("publish"));
        assert!(err.to_string().contains("bar"));
    }
}
