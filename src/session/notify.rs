//! Presence fan-out: who gets told when a user arrives or departs.
//!
//! Runs exactly twice per user lifetime, once on arrival and once on
//! departure, and never for a guest that dropped before finishing
//! login. The notify relations are recomputed from the directory each
//! time rather than maintained incrementally, because notify lists can
//! change while a user is offline.
//!
//! `notify_pin` is separate: it serves the presence-broadcast
//! preference variables, sending a machine-readable event to `pin_ivar`
//! sessions and a bracketed human line to `pin_var` sessions, with the
//! connecting address added for admins.

use std::collections::HashSet;
use std::net::SocketAddr;

use serde::Serialize;

use super::directory::{fold, Directory};
use super::session::SessionHandle;
use super::user::User;

/// The notify relations computed during one fan-out, kept on the session
/// afterwards so the command layer can display them.
#[derive(Debug, Default)]
pub struct NotifyOutcome {
    /// Online users who have this user on their notify list.
    pub notifiers_online: HashSet<String>,
    /// Online users this user's own notify list points at.
    pub notified_online: HashSet<String>,
}

/// Machine-readable presence event for `pin_ivar` sessions, one JSON
/// object per line.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum PresenceEvent {
    #[serde(rename = "user_arrived")]
    Arrived { name: String, guest: bool },
    #[serde(rename = "user_departed")]
    Departed { name: String, guest: bool },
}

/// Notify-list fan-out for one arrival or departure.
///
/// On arrival: tell the user which of the people on their notify list
/// are here; tell online adjourned-game opponents the user is back;
/// tell everyone tracking this user, except opponents already informed;
/// and summarize who was told. Departure runs only the tracking
/// traversal and the summary, with departed wording.
///
/// `handle` is the user's own session: at departure the directory entry
/// is already gone, so the entry cannot supply it.
pub fn notify_users(
    dir: &Directory,
    user: &User,
    handle: &SessionHandle,
    arrived: bool,
) -> NotifyOutcome {
    let mut outcome = NotifyOutcome::default();
    let self_key = fold(&user.name);

    // Both relations come from a directory scan, never from cache.
    for entry in dir.iter() {
        if fold(&entry.name) == self_key {
            continue;
        }
        if entry
            .user
            .vars
            .notify
            .iter()
            .any(|n| fold(n) == self_key)
        {
            outcome.notifiers_online.insert(entry.name.clone());
        }
    }
    for name in &user.vars.notify {
        if let Some(entry) = dir.find_exact(name) {
            outcome.notified_online.insert(entry.name.clone());
        }
    }

    if arrived && !outcome.notified_online.is_empty() {
        let mut present: Vec<&str> =
            outcome.notified_online.iter().map(String::as_str).collect();
        present.sort_unstable();
        handle.send_line(format!(
            "Present company on your notify list: {}.",
            present.join(" ")
        ));
    }

    // Adjourned-game opponents get a more specific notice and are
    // excluded from the generic one below.
    let mut informed: HashSet<String> = HashSet::new();
    if arrived {
        for game in &user.adjourned {
            let opp = game.opponent_of(&user.name);
            if let Some(entry) = dir.find_exact(opp) {
                entry.handle.send_line(format!(
                    "{}, who has an adjourned game with you, has arrived.",
                    user.name
                ));
                informed.insert(fold(&entry.name));
            }
        }
    }

    let wording = if arrived { "arrived" } else { "departed" };
    let mut noted: Vec<String> = Vec::new();
    for name in &outcome.notifiers_online {
        if informed.contains(&fold(name)) {
            continue;
        }
        if let Some(entry) = dir.find_exact(name) {
            entry
                .handle
                .send_line(format!("notification: {} has {wording}.", user.name));
            noted.push(entry.name.clone());
        }
    }

    if !user.vars.notify.is_empty() && !noted.is_empty() {
        noted.sort_unstable();
        let verb = if arrived { "arrival" } else { "departure" };
        handle.send_line(format!("Your {verb} was noted by: {}.", noted.join(" ")));
    }

    outcome
}

/// Presence broadcast to the pin preference sets.
///
/// `pin_ivar` sessions get one JSON event per line; `pin_var` sessions
/// get the bracketed human-readable line, with the connecting address
/// included for admins. The user's own session is skipped.
pub fn notify_pin(dir: &Directory, user: &User, addr: SocketAddr, arrived: bool) {
    let event = if arrived {
        PresenceEvent::Arrived {
            name: user.name.clone(),
            guest: user.guest,
        }
    } else {
        PresenceEvent::Departed {
            name: user.name.clone(),
            guest: user.guest,
        }
    };
    // Serialization of a field-only enum cannot fail.
    let machine = serde_json::to_string(&event).unwrap_or_default();

    let verb = if arrived { "connected" } else { "disconnected" };
    let human = format!("[{} has {verb}.]", user.name);
    let human_admin = format!("[{} has {verb} from {}.]", user.name, addr.ip());

    let self_key = fold(&user.name);
    for entry in dir.iter() {
        if fold(&entry.name) == self_key {
            continue;
        }
        if dir.in_pin_ivar(entry.handle.id) {
            entry.handle.send_line(machine.clone());
        }
        if dir.in_pin_var(entry.handle.id) {
            if entry.user.is_admin() {
                entry.handle.send_line(human_admin.clone());
            } else {
                entry.handle.send_line(human.clone());
            }
        }
    }
}
