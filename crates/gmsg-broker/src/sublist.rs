// Subject interest trie.
//
// Each level maps literal tokens to nodes and keeps optional `*` and `>`
// children. A lookup walks one level per subject token, so its cost depends on
// subject depth and the wildcards present, not on how many subscriptions are
// registered. The whole trie sits behind one RwLock: matches share the read
// side, insert/remove take the write side and are atomic with respect to
// concurrent matches.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::RandomState;
use gmsg_wire::subject::{self, FULL_WILDCARD, PARTIAL_WILDCARD};
use parking_lot::RwLock;
use smallvec::SmallVec;

pub use gmsg_wire::subject::matches;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SublistError {
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("subscription not found")]
    NotFound,
}

struct Level<T> {
    nodes: HashMap<String, Node<T>, RandomState>,
    pwc: Option<Box<Node<T>>>,
    fwc: Option<Box<Node<T>>>,
}

struct Node<T> {
    next: Option<Box<Level<T>>>,
    plain: SmallVec<[T; 4]>,
    // Queue group name to members, in registration order.
    queues: Vec<(String, Vec<T>)>,
}

impl<T> Default for Level<T> {
    fn default() -> Self {
        Self {
            nodes: HashMap::with_hasher(RandomState::new()),
            pwc: None,
            fwc: None,
        }
    }
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            next: None,
            plain: SmallVec::new(),
            queues: Vec::new(),
        }
    }
}

impl<T> Level<T> {
    fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.pwc.is_none() && self.fwc.is_none()
    }

    fn child_mut(&mut self, token: &str) -> Option<&mut Node<T>> {
        match token {
            PARTIAL_WILDCARD => self.pwc.as_deref_mut(),
            FULL_WILDCARD => self.fwc.as_deref_mut(),
            literal => self.nodes.get_mut(literal),
        }
    }

    fn child_or_insert(&mut self, token: &str) -> &mut Node<T> {
        match token {
            PARTIAL_WILDCARD => &mut **self.pwc.get_or_insert_with(Box::default),
            FULL_WILDCARD => &mut **self.fwc.get_or_insert_with(Box::default),
            literal => self.nodes.entry(literal.to_string()).or_default(),
        }
    }

    fn drop_child(&mut self, token: &str) {
        match token {
            PARTIAL_WILDCARD => self.pwc = None,
            FULL_WILDCARD => self.fwc = None,
            literal => {
                self.nodes.remove(literal);
            }
        }
    }
}

impl<T: PartialEq> Node<T> {
    fn is_empty(&self) -> bool {
        self.next.is_none() && self.plain.is_empty() && self.queues.is_empty()
    }

    fn add(&mut self, queue: Option<&str>, item: T) {
        match queue {
            None => self.plain.push(item),
            Some(name) => match self.queues.iter_mut().find(|(group, _)| group == name) {
                Some((_, members)) => members.push(item),
                None => self.queues.push((name.to_string(), vec![item])),
            },
        }
    }

    fn remove(&mut self, queue: Option<&str>, item: &T) -> bool {
        match queue {
            None => match self.plain.iter().position(|existing| existing == item) {
                Some(idx) => {
                    self.plain.remove(idx);
                    true
                }
                None => false,
            },
            Some(name) => {
                let Some(group_idx) = self.queues.iter().position(|(group, _)| group == name)
                else {
                    return false;
                };
                let members = &mut self.queues[group_idx].1;
                let Some(idx) = members.iter().position(|existing| existing == item) else {
                    return false;
                };
                members.remove(idx);
                if members.is_empty() {
                    self.queues.remove(group_idx);
                }
                true
            }
        }
    }
}

/// Subscribers matching one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SublistResult<T> {
    /// Subscribers that each receive every matching message.
    pub plain: Vec<T>,
    /// Queue groups by name; one member per group receives each message.
    pub queues: Vec<(String, Vec<T>)>,
}

impl<T> Default for SublistResult<T> {
    fn default() -> Self {
        Self {
            plain: Vec::new(),
            queues: Vec::new(),
        }
    }
}

impl<T> SublistResult<T> {
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.queues.is_empty()
    }

    /// Number of plain subscribers plus one per queue group.
    pub fn recipients(&self) -> usize {
        self.plain.len() + self.queues.len()
    }
}

impl<T: Clone> SublistResult<T> {
    fn absorb(&mut self, node: &Node<T>) {
        self.plain.extend(node.plain.iter().cloned());
        for (name, members) in &node.queues {
            match self.queues.iter_mut().find(|(group, _)| group == name) {
                Some((_, existing)) => existing.extend(members.iter().cloned()),
                None => self.queues.push((name.clone(), members.clone())),
            }
        }
    }
}

pub struct Sublist<T> {
    root: RwLock<Level<T>>,
    count: AtomicUsize,
}

impl<T> Default for Sublist<T> {
    fn default() -> Self {
        Self {
            root: RwLock::new(Level::default()),
            count: AtomicUsize::new(0),
        }
    }
}

impl<T> std::fmt::Debug for Sublist<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sublist")
            .field("count", &self.count())
            .finish()
    }
}

impl<T: Clone + PartialEq> Sublist<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `item` under `pattern`, optionally as a member of `queue`.
    pub fn insert(&self, pattern: &str, queue: Option<&str>, item: T) -> Result<(), SublistError> {
        subject::validate_pattern(pattern)
            .map_err(|_| SublistError::InvalidSubject(pattern.to_string()))?;
        let tokens: SmallVec<[&str; 8]> = subject::tokens(pattern).collect();
        let mut root = self.root.write();
        let mut level: &mut Level<T> = &mut root;
        let (last, prefix) = tokens
            .split_last()
            .ok_or_else(|| SublistError::InvalidSubject(pattern.to_string()))?;
        for token in prefix {
            let node = level.child_or_insert(token);
            level = &mut **node.next.get_or_insert_with(Box::default);
        }
        level.child_or_insert(last).add(queue, item);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove one registration of `item` under `pattern`/`queue`, pruning
    /// nodes left empty.
    pub fn remove(&self, pattern: &str, queue: Option<&str>, item: &T) -> Result<(), SublistError> {
        subject::validate_pattern(pattern)
            .map_err(|_| SublistError::InvalidSubject(pattern.to_string()))?;
        let tokens: SmallVec<[&str; 8]> = subject::tokens(pattern).collect();
        let mut root = self.root.write();
        if !remove_from(&mut root, &tokens, queue, item) {
            return Err(SublistError::NotFound);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Every registration whose pattern matches `subject`.
    ///
    /// Subjects with empty tokens match nothing.
    pub fn match_subject(&self, subject: &str) -> SublistResult<T> {
        let mut result = SublistResult::default();
        let tokens: SmallVec<[&str; 8]> = subject::tokens(subject).collect();
        if tokens.iter().any(|token| token.is_empty()) {
            return result;
        }
        let root = self.root.read();
        collect(&root, &tokens, &mut result);
        result
    }
}

impl<T> Sublist<T> {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

fn remove_from<T: PartialEq>(
    level: &mut Level<T>,
    tokens: &[&str],
    queue: Option<&str>,
    item: &T,
) -> bool {
    let Some((token, rest)) = tokens.split_first() else {
        return false;
    };
    let (removed, prune) = {
        let Some(node) = level.child_mut(token) else {
            return false;
        };
        let removed = if rest.is_empty() {
            node.remove(queue, item)
        } else {
            let removed = match node.next.as_deref_mut() {
                Some(next) => remove_from(next, rest, queue, item),
                None => false,
            };
            if removed && node.next.as_ref().is_some_and(|next| next.is_empty()) {
                node.next = None;
            }
            removed
        };
        (removed, node.is_empty())
    };
    if removed && prune {
        level.drop_child(token);
    }
    removed
}

fn collect<T: Clone>(level: &Level<T>, tokens: &[&str], out: &mut SublistResult<T>) {
    let Some((token, rest)) = tokens.split_first() else {
        return;
    };
    // `>` covers this token and everything after it.
    if let Some(fwc) = level.fwc.as_deref() {
        out.absorb(fwc);
    }
    if let Some(pwc) = level.pwc.as_deref() {
        visit(pwc, rest, out);
    }
    if let Some(node) = level.nodes.get(*token) {
        visit(node, rest, out);
    }
}

fn visit<T: Clone>(node: &Node<T>, rest: &[&str], out: &mut SublistResult<T>) {
    if rest.is_empty() {
        out.absorb(node);
    } else if let Some(next) = node.next.as_deref() {
        collect(next, rest, out);
    }
}
