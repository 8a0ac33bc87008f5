//! Event subscriptions and dispatch

use crate::{manager::Manager, message::Message};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

/// Callback invoked with each matching event and the manager that received it.
pub type EventCallback = Arc<dyn Fn(&Message, &Manager) + Send + Sync>;

/// Outcome of [`EventRegistry::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// This many callbacks ran.
    Delivered(usize),
    /// No registered pattern matched; the event was dropped.
    NoMatch,
}

impl Dispatch {
    /// Whether at least one callback ran.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Dispatch::Delivered(_))
    }
}

/// Case-sensitive glob match over the whole of `text`.
///
/// `*` matches any run of characters (including none), `?` exactly one.
///
/// ```
/// use asterisk_ami_tokio::glob_match;
///
/// assert!(glob_match("Peer*", "PeerStatus"));
/// assert!(!glob_match("Peer*", "NoPeerStatus"));
/// assert!(glob_match("*Status", "PeerStatus"));
/// ```
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern
        .chars()
        .collect();
    let t: Vec<char> = text
        .chars()
        .collect();
    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` and the text index it was tried against.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                star = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == '?' || c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    pi = sp + 1;
                    ti = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..]
        .iter()
        .all(|&c| c == '*')
}

struct Subscription {
    pattern: String,
    callbacks: Vec<EventCallback>,
}

/// Instance-owned map from glob patterns to callbacks.
///
/// Registering a pattern twice adds to its callback list. Dispatch snapshots
/// the matching callbacks under the lock and runs them after releasing it, so
/// a callback may register further subscriptions.
#[derive(Default)]
pub struct EventRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}

impl EventRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `callback` under `pattern`.
    pub fn register<F>(&self, pattern: impl Into<String>, callback: F)
    where
        F: Fn(&Message, &Manager) + Send + Sync + 'static,
    {
        self.register_arc(pattern, Arc::new(callback));
    }

    /// Add an already shared callback under `pattern`.
    pub fn register_arc(&self, pattern: impl Into<String>, callback: EventCallback) {
        let pattern = pattern.into();
        let mut subs = self
            .subscriptions
            .write();
        match subs
            .iter_mut()
            .find(|s| s.pattern == pattern)
        {
            Some(sub) => sub
                .callbacks
                .push(callback),
            None => subs.push(Subscription {
                pattern,
                callbacks: vec![callback],
            }),
        }
    }

    /// Remove every callback registered under exactly `pattern`.
    pub fn unregister(&self, pattern: &str) -> bool {
        let mut subs = self
            .subscriptions
            .write();
        let before = subs.len();
        subs.retain(|s| s.pattern != pattern);
        subs.len() != before
    }

    /// Registered patterns in registration order.
    pub fn patterns(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .iter()
            .map(|s| {
                s.pattern
                    .clone()
            })
            .collect()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.subscriptions
            .read()
            .is_empty()
    }

    /// Whether any pattern matches the event name.
    pub fn interested(&self, event_name: &str) -> bool {
        self.subscriptions
            .read()
            .iter()
            .any(|s| glob_match(&s.pattern, event_name))
    }

    fn callbacks_for(&self, event_name: &str) -> Vec<EventCallback> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| glob_match(&s.pattern, event_name))
            .flat_map(|s| {
                s.callbacks
                    .iter()
                    .cloned()
            })
            .collect()
    }

    /// Run every callback whose pattern matches the message's `Event`.
    ///
    /// Messages without an `Event` header never match. A panicking callback
    /// is logged and does not stop the others.
    pub fn dispatch(&self, message: &Message, manager: &Manager) -> Dispatch {
        let Some(name) = message.matches() else {
            return Dispatch::NoMatch;
        };
        let callbacks = self.callbacks_for(name);
        if callbacks.is_empty() {
            trace!("[DISPATCH] No subscription for event {}", name);
            return Dispatch::NoMatch;
        }
        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(message, manager))).is_err() {
                error!("[DISPATCH] Callback for event {} panicked", name);
            }
        }
        Dispatch::Delivered(callbacks.len())
    }
}
