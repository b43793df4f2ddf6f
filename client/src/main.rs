use clap::Parser;
use client::network::push_endpoint;
use client::{Collaborators, Intent, Notice, SyncConfig, SyncSession};
use log::{error, info, warn};
use shared::{AuthoritativeView, Session};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the game server
    #[arg(short = 's', long, default_value = "http://127.0.0.1:8000")]
    server: String,

    /// Lobby (or game) id to join
    #[arg(short = 'l', long)]
    session: String,

    /// Player id to act as
    #[arg(short = 'p', long)]
    player: String,

    /// Session token issued by the server
    #[arg(short = 't', long, env = "LOBBY_TOKEN", hide_env_values = true)]
    token: String,

    /// Attach to a running game instead of a lobby
    #[arg(short = 'g', long)]
    game: bool,

    /// Number of log lines to keep
    #[arg(long, default_value = "500")]
    log_capacity: usize,

    /// Keep polling slowly while the push channel is healthy
    #[arg(long)]
    fallback_poll: bool,

    /// Mark ourselves ready once joined
    #[arg(short = 'r', long)]
    ready: bool,
}

fn describe(view: &AuthoritativeView) -> String {
    let mut text = format!(
        "{:?}: {}/{} ready, {} seated",
        view.status(),
        view.ready_count(),
        view.human_count(),
        view.occupied_count()
    );
    if let Some(name) = view.host().and_then(|host| host.name.as_deref()) {
        text.push_str(&format!(", hosted by {}", name));
    }
    if let Some(seconds) = view.countdown() {
        text.push_str(&format!(", starting in {}s", seconds));
    }
    if let Some(game) = view.started_session() {
        text.push_str(&format!(", game {}", game));
    }
    text
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let session = if args.game {
        Session::game(&args.session, &args.player, &args.token)
    } else {
        Session::lobby(&args.session, &args.player, &args.token)
    };

    let mut config = SyncConfig {
        log_capacity: args.log_capacity,
        ..SyncConfig::default()
    };
    if args.fallback_poll {
        config = config.with_fallback_poll();
    }

    info!("Starting client...");
    info!("Joining {} as {}", args.session, args.player);

    let endpoint = push_endpoint(&args.server, &session)?;
    let collaborators = Collaborators::http(&args.server, &config)?;
    let (handle, mut notices) = SyncSession::spawn(session, config, &endpoint, collaborators);

    let mut view = handle.view();
    let mut connection = handle.connection();
    let mut ready_sent = !args.ready;
    let mut connection_alive = true;

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                if let Some(current) = current {
                    info!("{}", describe(&current));
                    if !ready_sent && current.slot_of(&args.player).is_some() {
                        ready_sent = true;
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            match handle.submit(Intent::SetReady { ready: true }).await {
                                Ok(id) => info!("Ready toggle {} acknowledged", id),
                                Err(e) => warn!("Ready toggle failed: {}", e),
                            }
                        });
                    }
                }
            }
            changed = connection.changed(), if connection_alive => {
                if changed.is_err() {
                    connection_alive = false;
                    continue;
                }
                let state = connection.borrow_and_update().clone();
                info!("Connection {:?} (attempt {})", state.status, state.attempt);
            }
            notice = notices.recv() => match notice {
                Some(Notice::Unauthorized(reason)) => {
                    error!("Credentials refused: {}", reason);
                    break;
                }
                Some(notice) => info!("{:?}", notice),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving session");
                break;
            }
        }
    }

    handle.close();
    handle.with_logs(|logs| {
        for entry in logs.entries() {
            info!("[{:?}] {}", entry.severity, entry.text);
        }
    });

    Ok(())
}
