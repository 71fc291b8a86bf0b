//! Subject routing for the gmessage broker.
//!
//! # Purpose
//! [`Sublist`] stores subscription interest keyed by subject pattern, and
//! [`Broker`] uses it to fan published messages out to client queues.
//!
//! # Key invariants
//! - Pattern `>` is only valid as the final token; invalid patterns fail at
//!   insert time and lookups never fail.
//! - A publish never blocks on a slow client. A full client queue drops the new
//!   message and counts it.
//! - Exactly one member of each matching queue group receives a message.
//!
//! # Examples
//! ```rust
//! use gmsg_broker::Sublist;
//!
//! let list = Sublist::new();
//! list.insert("orders.>", None, "audit").unwrap();
//! list.insert("orders.*", Some("workers"), "w1").unwrap();
//! let result = list.match_subject("orders.eu");
//! assert_eq!(result.plain, vec!["audit"]);
//! assert_eq!(result.queues[0].1, vec!["w1"]);
//! ```
mod broker;
pub mod sublist;

pub use broker::{Broker, ClientHandle, ClientId, DEFAULT_CLIENT_QUEUE_CAPACITY, Subscriber};
pub use sublist::{Sublist, SublistError, SublistResult, matches};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("client {0} is gone")]
    ClientGone(ClientId),
    #[error(transparent)]
    Sublist(#[from] SublistError),
}
