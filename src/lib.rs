//! gambit: the real-time session and protocol core of a multiplayer
//! chess server.
//!
//! This crate owns connections, presence, and the wire protocol. Chess
//! rules, accounts, and the command table are collaborators wired in
//! through [`session::Services`].

pub mod session;
