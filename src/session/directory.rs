//! Presence directory: the authoritative registry of who is online.
//!
//! Names are unique case-insensitively; the lowercased name is the key.
//! A single ordered map serves both exact lookup and prefix search, and
//! gives every full pass a stable, deterministic order.
//!
//! The directory also maintains the derived notification-eligibility
//! sets (`pin_var`, `pin_ivar`, `gin_var`) incrementally: a session
//! joins a set at add time if the matching preference is on, and leaves
//! all three at remove time. Removal from a set the session was never
//! in is a no-op, not an error.
//!
//! Duplicate insertion and prefix search on an exactly-online name are
//! programming-contract violations and assert loudly; they must never
//! happen in correct operation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::session::{SessionHandle, SessionId};
use super::user::User;

/// Case fold for name comparison.
pub fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// One online user: display name, account data, and the live session.
#[derive(Debug)]
pub struct PresenceEntry {
    /// Display name, original case.
    pub name: String,
    pub user: Arc<User>,
    pub handle: SessionHandle,
}

/// Registry of online users plus the derived notification sets.
#[derive(Debug, Default)]
pub struct Directory {
    /// Lowercased name to entry. Ordered, so prefix search is a range
    /// scan and iteration order is stable.
    entries: BTreeMap<String, PresenceEntry>,
    /// How many current entries are guests.
    guests: usize,
    pin_var: HashSet<SessionId>,
    pin_ivar: HashSet<SessionId>,
    gin_var: HashSet<SessionId>,
}

impl Directory {
    pub fn new() -> Self {
        Directory::default()
    }

    /// Insert a freshly logged-in user.
    ///
    /// The name must not already be online; callers check `is_online`
    /// under the same lock before calling. A duplicate is a contract
    /// violation, not a recoverable error.
    pub fn add(&mut self, user: Arc<User>, handle: SessionHandle) {
        let key = fold(&user.name);
        assert!(
            !self.entries.contains_key(&key),
            "duplicate presence entry: {key}"
        );
        if user.guest {
            self.guests += 1;
        }
        if user.vars.pin {
            self.pin_var.insert(handle.id);
        }
        if user.ivar_pin {
            self.pin_ivar.insert(handle.id);
        }
        if user.vars.gin {
            self.gin_var.insert(handle.id);
        }
        self.entries.insert(
            key,
            PresenceEntry {
                name: user.name.clone(),
                user,
                handle,
            },
        );
    }

    /// Remove a user at disconnect. Clears the session from all three
    /// derived sets whether or not it was in them.
    pub fn remove(&mut self, name: &str) -> Option<PresenceEntry> {
        let entry = self.entries.remove(&fold(name))?;
        if entry.user.guest {
            self.guests -= 1;
        }
        self.pin_var.remove(&entry.handle.id);
        self.pin_ivar.remove(&entry.handle.id);
        self.gin_var.remove(&entry.handle.id);
        Some(entry)
    }

    /// Exact lookup by name, case-insensitive. Never panics.
    pub fn find_exact(&self, name: &str) -> Option<&PresenceEntry> {
        self.entries.get(&fold(name))
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.entries.contains_key(&fold(name))
    }

    /// All entries whose name starts with `prefix`, case-insensitive.
    ///
    /// Exact-match resolution takes precedence in the surrounding
    /// command layer, so calling this with a name that is itself online
    /// is a precondition violation.
    pub fn find_part(&self, prefix: &str) -> Vec<&PresenceEntry> {
        let p = fold(prefix);
        assert!(
            !self.entries.contains_key(&p),
            "find_part called with an exactly-online name: {p}"
        );
        self.entries
            .range(p.clone()..)
            .take_while(|(key, _)| key.starts_with(&p))
            .map(|(_, entry)| entry)
            .collect()
    }

    /// All online users, ordered by lowercased name. The order is stable
    /// for the duration of a pass; the heartbeat relies on that.
    pub fn iter(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of online guests. Always equals the count of entries whose
    /// user is flagged guest.
    pub fn guest_count(&self) -> usize {
        self.guests
    }

    pub fn in_pin_var(&self, id: SessionId) -> bool {
        self.pin_var.contains(&id)
    }

    pub fn in_pin_ivar(&self, id: SessionId) -> bool {
        self.pin_ivar.contains(&id)
    }

    pub fn in_gin_var(&self, id: SessionId) -> bool {
        self.gin_var.contains(&id)
    }
}
