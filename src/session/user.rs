//! User collaborator contract.
//!
//! Authentication, registration, and persistence live outside this crate.
//! The session core only needs the fields and queries below: identity,
//! role, the notification preference variables, and the adjourned-game
//! summaries used by the arrival fan-out.

use std::sync::Arc;

use async_trait::async_trait;

/// Per-user preference variables consumed by the session core.
///
/// `pin` and `gin` request human-readable connect/disconnect and
/// game-start/end broadcasts; `autoflag` opts the user into automatic
/// flag-fall checks on their games; `notify` is the list of names whose
/// presence this user wants to be told about.
#[derive(Debug, Clone, Default)]
pub struct UserVars {
    pub pin: bool,
    pub gin: bool,
    pub autoflag: bool,
    pub notify: Vec<String>,
}

/// A suspended game awaiting both players' return.
#[derive(Debug, Clone)]
pub struct AdjournedGame {
    pub white_id: i64,
    pub black_id: i64,
    pub white_name: String,
    pub black_name: String,
}

impl AdjournedGame {
    /// The name of the other player in this game.
    pub fn opponent_of(&self, name: &str) -> &str {
        if self.white_name.eq_ignore_ascii_case(name) {
            &self.black_name
        } else {
            &self.white_name
        }
    }
}

/// Coarse role classification used for policy checks.
///
/// Idle-timeout exemption is a property of the role, not of scattered
/// boolean flags: admins and tournament directors are never auto-logged-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Player,
    TournamentDirector,
    Admin,
}

/// An authenticated (or guest) user as seen by the session core.
#[derive(Debug, Clone, Default)]
pub struct User {
    /// Display name, original case preserved.
    pub name: String,
    /// True for unregistered guest accounts.
    pub guest: bool,
    pub admin: bool,
    /// Titles such as "TD", "GM". Compared case-insensitively.
    pub titles: Vec<String>,
    pub vars: UserVars,
    /// Interface variable: machine-readable presence events.
    pub ivar_pin: bool,
    pub adjourned: Vec<AdjournedGame>,
}

impl User {
    /// A throwaway guest account for an unrecognized login name.
    pub fn guest(name: &str) -> Self {
        User {
            name: name.to_owned(),
            guest: true,
            ..Default::default()
        }
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn has_title(&self, title: &str) -> bool {
        self.titles.iter().any(|t| t.eq_ignore_ascii_case(title))
    }

    pub fn role(&self) -> Role {
        if self.admin {
            Role::Admin
        } else if self.has_title("TD") {
            Role::TournamentDirector
        } else {
            Role::Player
        }
    }

    /// Whether the heartbeat may auto-logout this user for idleness.
    pub fn idle_exempt(&self) -> bool {
        !matches!(self.role(), Role::Player)
    }
}

/// Lookup into the external account database.
///
/// `None` means no registered account with that name exists; the login
/// layer falls back to a guest session.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn lookup(&self, name: &str) -> Option<Arc<User>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_has_no_privileges() {
        let u = User::guest("visitor");
        assert!(u.guest);
        assert!(!u.is_admin());
        assert_eq!(u.role(), Role::Player);
        assert!(!u.idle_exempt());
    }

    #[test]
    fn title_lookup_is_case_insensitive() {
        let u = User {
            name: "Judge".into(),
            titles: vec!["td".into()],
            ..Default::default()
        };
        assert!(u.has_title("TD"));
        assert_eq!(u.role(), Role::TournamentDirector);
        assert!(u.idle_exempt());
    }

    #[test]
    fn admin_outranks_td_title() {
        let u = User {
            name: "Root".into(),
            admin: true,
            titles: vec!["TD".into()],
            ..Default::default()
        };
        assert_eq!(u.role(), Role::Admin);
        assert!(u.idle_exempt());
    }

    #[test]
    fn adjourned_opponent_lookup() {
        let g = AdjournedGame {
            white_id: 1,
            black_id: 2,
            white_name: "Alice".into(),
            black_name: "Bob".into(),
        };
        assert_eq!(g.opponent_of("alice"), "Bob");
        assert_eq!(g.opponent_of("BOB"), "Alice");
    }
}
