//! Heartbeat: the fixed-cadence housekeeping tick.
//!
//! Every period the scheduler makes one pass over the presence
//! directory (idle timeouts, keepalive pings) and one pass over the
//! active games (flag-fall checks). Flag checks are issued within the
//! tick but complete on their own time; the next tick never waits for
//! them.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::directory::Directory;
use super::game::GameRegistry;
use super::metrics::{FLAG_CHECKS, IDLE_DISCONNECTS, PINGS_SENT};
use super::server::SharedState;
use super::session::{epoch_secs, SessionEvent};

/// Spawn the heartbeat task. It runs until the process exits.
pub fn spawn(state: SharedState, games: Arc<dyn GameRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (period_secs, idle_timeout_secs) = {
            let st = state.read().await;
            (st.config.heartbeat_secs, st.config.idle_timeout_secs)
        };
        let mut ticker = tokio::time::interval(Duration::from_secs(period_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let (timeouts, pings) = {
                let st = state.read().await;
                sweep_sessions(&st.directory, epoch_secs(), idle_timeout_secs)
            };
            let flags = sweep_clocks(games.as_ref());
            counter!(IDLE_DISCONNECTS).increment(timeouts as u64);
            counter!(PINGS_SENT).increment(pings as u64);
            counter!(FLAG_CHECKS).increment(flags as u64);
            if timeouts + pings + flags > 0 {
                debug!(timeouts, pings, flags, "heartbeat tick");
            }
        }
    })
}

/// One pass over the directory: queue idle disconnects and keepalives.
///
/// Users whose role exempts them from the idle policy are never timed
/// out. Pings go only to sessions whose negotiated mode answers them
/// (zipseal and timeseal v2).
pub(crate) fn sweep_sessions(
    dir: &Directory,
    now_secs: u64,
    idle_timeout_secs: u64,
) -> (usize, usize) {
    let mut timeouts = 0;
    let mut pings = 0;
    for entry in dir.iter() {
        if !entry.user.idle_exempt() && entry.handle.idle_secs(now_secs) > idle_timeout_secs {
            entry.handle.send_event(SessionEvent::IdleTimeout {
                minutes: idle_timeout_secs / 60,
            });
            timeouts += 1;
            continue;
        }
        if entry.handle.seal_mode.wants_ping() {
            entry.handle.send_event(SessionEvent::Ping);
            pings += 1;
        }
    }
    (timeouts, pings)
}

/// One pass over the active games: issue a flag check for every ticking
/// clock whose on-move player faces an opponent with autoflag on.
///
/// Each qualifying game is checked exactly once per call. The checks
/// run as their own tasks; this function returns as soon as all of them
/// have been issued.
pub(crate) fn sweep_clocks(games: &dyn GameRegistry) -> usize {
    let mut issued = 0;
    for game in games.active_games() {
        if !game.clock().is_ticking() {
            continue;
        }
        let on_move = game.user_to_move();
        let opponent = game.opponent_of(&on_move);
        if !opponent.vars.autoflag {
            continue;
        }
        if let Some(check) = game.clock().check_flag(game.side_to_move()) {
            tokio::spawn(check);
            issued += 1;
        }
    }
    issued
}
