//! Users, permissions and permission enforcement for gmessage brokers.
//!
//! # Purpose
//! Holds the authorization record for every configured identity and answers
//! "may this connection publish to / subscribe on this subject".
//!
//! # Key invariants
//! - A missing permission list means unrestricted, an empty list means deny-all.
//!   The distinction survives cloning and (de)serialization.
//! - Cloning a [`User`] is a deep copy. Mutating a clone never changes the source.
//! - [`UserStore::reload`] swaps in a fresh snapshot and never mutates records
//!   held by live connections.
//!
//! # Examples
//! ```rust
//! use gmsg_authz::{Action, PermissionMatcher, Permissions};
//!
//! let perms = Permissions {
//!     publish: Some(vec!["foo".to_string()]),
//!     subscribe: None,
//! };
//! let matcher = PermissionMatcher::new(&perms);
//! assert!(matcher.allows(Action::Publish, "foo"));
//! assert!(!matcher.allows(Action::Publish, "bar"));
//! assert!(matcher.allows(Action::Subscribe, "anything.>"));
//! ```

mod action;
mod errors;
mod matcher;
mod store;
mod user;

pub use action::Action;
pub use errors::{AuthzError, AuthzResult};
pub use matcher::PermissionMatcher;
pub use store::{ResolvedUser, UserStore};
pub use user::{Permissions, User, clone_user};
