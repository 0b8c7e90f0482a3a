use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use enroll_core::enrollment::HttpEnrollmentApi;
use enroll_core::signaling::WebSocketConnector;
use enroll_core::transport::WebRtcConnector;
use enroll_core::{
    CancelOrigin, PairingCode, PairingConfig, PairingContext, ProviderSession, ProviderState,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "enroll",
    about = "Enroll a new device's passkey from a device that is already signed in",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "ENROLL_SERVER_BASE",
        default_value = "http://127.0.0.1:8080",
        help = "Base URL of the account server"
    )]
    server: String,

    #[arg(
        long,
        global = true,
        env = "ENROLL_BEARER_TOKEN",
        hide_env_values = true,
        help = "Bearer token for the signed-in account"
    )]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a pairing room and hand the new device an enrollment token
    Provide(ProvideArgs),
}

#[derive(Args, Debug)]
struct ProvideArgs {
    #[arg(long, short = 'c', value_name = "CODE", help = "Code shown on the new device")]
    code: String,

    #[arg(
        long,
        short = 'y',
        action = clap::ArgAction::SetTrue,
        help = "Approve the new device without prompting"
    )]
    yes: bool,
}

enum Notice {
    State(ProviderState),
    ApprovalRequested,
    Cancelled(CancelOrigin),
    Error(String),
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PairingConfig::from_env(&cli.server)?.with_bearer_token(cli.token.clone());
    debug!(server = %config.server_base(), signaling = %config.signaling_url(), "configuration loaded");

    match cli.command {
        Command::Provide(args) => provide(config, args).await,
    }
}

async fn provide(config: PairingConfig, args: ProvideArgs) -> Result<()> {
    if config.bearer_token().is_none() {
        bail!("providing a token requires --token or ENROLL_BEARER_TOKEN");
    }
    let api = HttpEnrollmentApi::new(&config).context("building registration client")?;
    let signaling =
        WebSocketConnector::new().with_bearer_token(config.bearer_token().map(str::to_string));
    let peers = WebRtcConnector::new(config.ice_servers().to_vec());
    let context = PairingContext::new(config, Arc::new(signaling), Arc::new(peers), Arc::new(api));
    let session = ProviderSession::new(context);

    let (tx, mut notices) = mpsc::unbounded_channel();
    let events = session.events();
    let sender = tx.clone();
    events.state.subscribe(move |state| {
        let _ = sender.send(Notice::State(state));
    });
    let sender = tx.clone();
    events.approval_requested.subscribe(move |()| {
        let _ = sender.send(Notice::ApprovalRequested);
    });
    let sender = tx.clone();
    events.cancelled.subscribe(move |origin| {
        let _ = sender.send(Notice::Cancelled(origin));
    });
    events.error.subscribe(move |reason| {
        let _ = tx.send(Notice::Error(reason));
    });

    let code = PairingCode::parse(&args.code)?;
    session.connect_with_code(code.as_str()).await?;
    println!("🔗 Joining pairing room {code}");

    while let Some(notice) = notices.recv().await {
        match notice {
            Notice::State(state) => {
                info!(%state, "pairing state");
                if state == ProviderState::Completed {
                    println!("✅ New device enrolled");
                    return Ok(());
                }
            }
            Notice::ApprovalRequested => {
                if args.yes || confirm("Approve the new device? [y/N] ").await? {
                    session.provide_token().await?;
                    println!("🔑 Enrollment token sent; waiting for the new device");
                } else {
                    session.cancel().await?;
                }
            }
            Notice::Cancelled(CancelOrigin::Local) => bail!("pairing cancelled"),
            Notice::Cancelled(CancelOrigin::Remote) => bail!("the new device cancelled pairing"),
            Notice::Error(reason) => {
                warn!(%reason, "pairing failed");
                bail!("pairing failed: {reason}");
            }
        }
    }
    bail!("pairing ended in state {}", session.state())
}

async fn confirm(prompt: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading approval")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes" | "Yes"))
}
