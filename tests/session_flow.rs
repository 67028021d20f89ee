//! End-to-end tests over real TCP connections.
//!
//! Each test starts a server on an ephemeral port with stub
//! collaborators (a two-account store, a tiny command table, no games)
//! and drives it with plain socket clients, the way an actual client
//! would: read the login prompt, log in, issue commands, watch for
//! presence notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use gambit::session::{
    self, block,
    game::NoGames,
    session::Conn,
    timeseal::SealPaths,
    user::{User, UserStore, UserVars},
    CommandRegistry, ServerConfig, Services,
};

/// One registered account: Bob, who watches alice and has pin set.
struct TestStore;

#[async_trait]
impl UserStore for TestStore {
    async fn lookup(&self, name: &str) -> Option<Arc<User>> {
        if name.eq_ignore_ascii_case("bob") {
            Some(Arc::new(User {
                name: "Bob".into(),
                vars: UserVars {
                    pin: true,
                    notify: vec!["alice".into()],
                    ..Default::default()
                },
                ..Default::default()
            }))
        } else {
            None
        }
    }
}

/// Minimal command table: echo, block-mode toggle, quit.
struct TestCommands;

#[async_trait]
impl CommandRegistry for TestCommands {
    async fn dispatch(&self, conn: &mut Conn, text: &str) -> u32 {
        let (verb, rest) = text.split_once(' ').unwrap_or((text, ""));
        match verb {
            "echo" => {
                let _ = conn.write_line(rest).await;
                0
            }
            "blockon" => {
                conn.session.block_mode = true;
                let _ = conn.write_line("Block mode on.").await;
                0
            }
            "quit" => {
                conn.session.quit = true;
                0
            }
            _ => block::CODE_BADCOMMAND,
        }
    }
}

async fn start_server(max_users: usize, idle_secs: u64, heartbeat_secs: u64) -> std::net::SocketAddr {
    let config = ServerConfig {
        max_users,
        idle_timeout_secs: idle_secs,
        heartbeat_secs,
        seal: SealPaths {
            timeseal_decoder: "cat".into(),
            zipseal_decoder: "cat".into(),
            zipseal_encoder: "cat".into(),
        },
    };
    let services = Services {
        users: Arc::new(TestStore),
        commands: Arc::new(TestCommands),
        games: Arc::new(NoGames),
    };
    let (_state, addrs, _handles) = session::start(&["127.0.0.1:0"], config, services)
        .await
        .expect("server start");
    addrs[0]
}

/// Plain socket client that accumulates a transcript.
struct Client {
    stream: TcpStream,
    transcript: Vec<u8>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Client {
            stream,
            transcript: Vec::new(),
        }
    }

    async fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("send");
    }

    /// Read until the transcript contains `marker`, or panic after 5s.
    async fn expect(&mut self, marker: &str) -> String {
        loop {
            let text = String::from_utf8_lossy(&self.transcript).into_owned();
            if text.contains(marker) {
                return text;
            }
            let mut chunk = [0u8; 1024];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .unwrap_or_else(|_| panic!("timeout waiting for {marker:?}; got: {text:?}"))
                .expect("read");
            if n == 0 {
                panic!("connection closed waiting for {marker:?}; got: {text:?}");
            }
            self.transcript.extend_from_slice(&chunk[..n]);
        }
    }

    /// Assert the transcript never contains `marker` (checked as-is,
    /// without further reads).
    fn assert_absent(&self, marker: &str) {
        let text = String::from_utf8_lossy(&self.transcript);
        assert!(
            !text.contains(marker),
            "unexpected {marker:?} in transcript: {text:?}"
        );
    }
}

async fn login(addr: std::net::SocketAddr, name: &str) -> Client {
    let mut c = Client::connect(addr).await;
    c.expect("login: ").await;
    c.send(name).await;
    c.expect("Starting session as").await;
    c
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn guest_login_reaches_a_session() {
    let addr = start_server(100, 3600, 10).await;
    let mut c = Client::connect(addr).await;
    c.expect("login: ").await;
    c.send("alice").await;
    let text = c.expect("**** Starting session as alice ****").await;
    assert!(text.contains("you are not registered"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_name_is_reprompted() {
    let addr = start_server(100, 3600, 10).await;
    let mut c = Client::connect(addr).await;
    c.expect("login: ").await;
    c.send("x1!").await;
    c.expect("Names may contain only letters").await;
    c.send("carol").await;
    c.expect("Starting session as carol").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn arrival_and_departure_notifications() {
    let addr = start_server(100, 3600, 10).await;
    let mut bob = login(addr, "bob").await;

    let mut alice = login(addr, "alice").await;
    // Bob watches alice, so he gets the notify-list notice, and his pin
    // variable earns him the bracketed connect line too.
    bob.expect("notification: alice has arrived.").await;
    bob.expect("[alice has connected.]").await;

    alice.send("quit").await;
    bob.expect("notification: alice has departed.").await;
    bob.expect("[alice has disconnected.]").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_mode_frames_command_output() {
    let addr = start_server(100, 3600, 10).await;
    let mut c = login(addr, "carol").await;

    c.send("blockon").await;
    c.expect("Block mode on.").await;

    c.send("12 echo hello there").await;
    c.expect("\u{15}12\u{16}0\u{16}hello there\n\u{17}").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_mode_rejects_missing_sequence() {
    let addr = start_server(100, 3600, 10).await;
    let mut c = login(addr, "carol").await;

    c.send("blockon").await;
    c.expect("Block mode on.").await;

    c.send("who").await;
    c.expect(&format!("\u{15}0\u{16}{}\u{16}\u{17}", block::CODE_NOSEQUENCE))
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_login_is_refused() {
    let addr = start_server(100, 3600, 10).await;
    let _bob = login(addr, "bob").await;

    let mut second = Client::connect(addr).await;
    second.expect("login: ").await;
    second.send("bob").await;
    second.expect("Sorry, bob is already logged in.").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_server_refuses_new_logins() {
    let addr = start_server(1, 3600, 10).await;
    let _bob = login(addr, "bob").await;

    let mut alice = Client::connect(addr).await;
    alice.expect("login: ").await;
    alice.send("alice").await;
    alice.expect("Sorry, the server is full.").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_session_is_auto_logged_out() {
    let addr = start_server(100, 1, 1).await;
    let mut bob = login(addr, "bob").await;
    let mut alice = login(addr, "alice").await;

    // Neither client sends anything; the heartbeat cuts both off.
    alice
        .expect("**** Auto-logout because you were idle more than 0 minutes. ****")
        .await;
    bob.expect("Auto-logout").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_sessions_never_see_keepalive_pings() {
    let addr = start_server(100, 3600, 1).await;
    let mut c = login(addr, "carol").await;

    // Give the heartbeat a few periods to (wrongly) ping us.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    c.send("echo done").await;
    c.expect("done").await;
    c.assert_absent("[G]");
}
