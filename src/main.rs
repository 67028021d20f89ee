use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use gambit::session::{self, block, game::NoGames, session::Conn, user::User};

/// Store with no registered accounts: every login becomes a guest.
/// A real deployment wires in the account database instead.
struct GuestOnlyStore;

#[async_trait]
impl session::user::UserStore for GuestOnlyStore {
    async fn lookup(&self, _name: &str) -> Option<Arc<User>> {
        None
    }
}

/// Built-in command table for a bare session server: enough to log in,
/// look around, and leave. The full table is a separate component.
struct BasicCommands;

#[async_trait]
impl session::CommandRegistry for BasicCommands {
    async fn dispatch(&self, conn: &mut Conn, text: &str) -> u32 {
        let (verb, _rest) = text.split_once(' ').unwrap_or((text, ""));
        match verb {
            "quit" | "exit" => {
                let _ = conn.write_line("Thank you for playing.").await;
                conn.session.quit = true;
                0
            }
            "" => 0,
            _ => {
                let _ = conn
                    .write_line(&format!("{verb}: Command not found."))
                    .await;
                block::CODE_BADCOMMAND
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("gambit — {}", *session::server::SERVER_NAME);

    let bind_addr = std::env::var("GAMBIT_BIND").unwrap_or_else(|_| "0.0.0.0:5000".to_string());

    let services = session::Services {
        users: Arc::new(GuestOnlyStore),
        commands: Arc::new(BasicCommands),
        games: Arc::new(NoGames),
    };

    session::run(
        &[bind_addr.as_str()],
        session::ServerConfig::from_env(),
        services,
    )
    .await
}
