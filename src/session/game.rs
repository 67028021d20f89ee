//! Game collaborator contract.
//!
//! Chess rules, move validation, and clock arithmetic live outside this
//! crate. The heartbeat only needs to walk the active games, see whether a
//! clock is running, and hand the flag decision back to the clock itself.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::user::User;

/// The two sides of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }
}

/// The chess clock attached to an active game.
pub trait GameClock: Send + Sync {
    /// True while the clock is running for either side.
    fn is_ticking(&self) -> bool;

    /// Start a flag-fall check for `side`. Returns the pending check, or
    /// `None` when no check is warranted (e.g. time remains for certain).
    ///
    /// The check is asynchronous; the caller spawns it and does not wait
    /// for its completion.
    fn check_flag(&self, side: Side) -> Option<BoxFuture<'static, ()>>;
}

/// An active game as seen by the heartbeat scheduler.
pub trait Game: Send + Sync {
    fn clock(&self) -> &dyn GameClock;
    fn user_to_move(&self) -> Arc<User>;
    fn side_to_move(&self) -> Side;
    fn opponent_of(&self, user: &User) -> Arc<User>;
}

/// The external registry of games currently being played.
pub trait GameRegistry: Send + Sync {
    fn active_games(&self) -> Vec<Arc<dyn Game>>;
}

/// A registry with no games. Useful for embedders that only want the
/// session layer, and for tests.
#[derive(Debug, Default)]
pub struct NoGames;

impl GameRegistry for NoGames {
    fn active_games(&self) -> Vec<Arc<dyn Game>> {
        Vec::new()
    }
}
