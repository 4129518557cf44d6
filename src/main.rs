use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use wa_session::gateway::normalize_phone;
use wa_session::{
    AccountId, Connector, CredentialStore, FileCredentialStore, LoopbackConnector, MemoryTracker,
    MessageGateway, SessionConfig, SessionError, SessionRegistry, WebSocketConnector, JID,
};

/// How long `pair` waits for the phone to scan over the real transport.
const SCAN_WAIT: Duration = Duration::from_secs(180);

/// Reference CLI driving WhatsApp sessions over the WhatsApp web socket.

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the directory holding stored credentials.
    #[arg(long)]
    credentials_dir: Option<String>,

    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long)]
    verbose: bool,

    /// Use the in-process loopback peer instead of the WhatsApp web socket.
    #[arg(long)]
    loopback: bool,

    /// WebSocket endpoint to dial.
    #[arg(long, default_value = wa_session::protocol::websocket::endpoints::URL)]
    endpoint: String,

    /// Choose a command to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pair an account: show the QR challenge and wait for the phone to scan it.
    /// With `--loopback` the scan is simulated from `phone`.
    Pair { account: String, phone: String },
    /// Show the stored credential and live status of an account.
    Status { account: String },
    /// Resume a paired account and send a text message.
    Send {
        account: String,
        to: String,
        message: String,
    },
    /// Disconnect an account and delete its credentials.
    Logout { account: String },
    /// Print the current configuration.
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(dir) = cli.credentials_dir {
        config = config.with_credentials_path(dir);
    }

    if let Commands::ShowConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = Arc::new(FileCredentialStore::open(&config.credentials_path).await?);
    let peer = cli.loopback.then(LoopbackConnector::new);
    let connector: Arc<dyn Connector> = match &peer {
        Some(peer) => Arc::new(peer.clone()),
        None => Arc::new(WebSocketConnector::new(cli.endpoint)),
    };
    let tracker = Arc::new(MemoryTracker::new());
    let registry = SessionRegistry::new(config, connector, store.clone(), tracker.clone())?;

    let result = run(cli.command, &registry, peer.as_ref(), store.as_ref(), &tracker).await;
    registry.shutdown_all().await;
    result
}

async fn run(
    command: Commands,
    registry: &SessionRegistry,
    peer: Option<&LoopbackConnector>,
    store: &FileCredentialStore,
    tracker: &MemoryTracker,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Pair { account, phone } => {
            let account = AccountId::new(account);
            let phone_jid = normalize_phone(&phone, registry.config().default_country_code.as_deref())?;

            let status = registry.connect(&account).await?;
            if status.is_connected() {
                println!("{} is already paired as {:?}", account, status.me);
                return Ok(());
            }
            if let Some(challenge) = &status.pairing {
                println!("{}", challenge.render_ascii()?);
                println!("Pairing code: {}", challenge.code);
                println!("Valid until: {}", challenge.expires_at);
            }

            let wait = match peer {
                Some(peer) => {
                    println!("Simulating scan from {}", phone_jid);
                    peer.scan(&account, JID::new_device(phone_jid.user, 1)).await?;
                    Duration::from_secs(30)
                }
                None => {
                    println!("Scan the code with the WhatsApp app on {}", phone_jid);
                    SCAN_WAIT
                }
            };
            let handle = registry.get_or_create(&account);
            let status = tokio::time::timeout(
                wait,
                handle.wait_for(|s| s.is_connected() || s.error.is_some()),
            )
            .await??;

            match (&status.me, &status.error) {
                (Some(me), None) => println!("Paired {} as {}", account, me),
                (_, Some(failure)) => eprintln!("Pairing failed: {}", failure.message),
                (None, None) => eprintln!("Pairing did not complete."),
            }
        }
        Commands::Status { account } => {
            let account = AccountId::new(account);
            match store.get(&account).await? {
                None => {
                    println!("{}: no stored credentials", account);
                    return Ok(());
                }
                Some(row) => println!("{}: credentials stored, updated {}", account, row.updated_at),
            }
            if let Err(err) = registry.connect(&account).await {
                eprintln!("Resume failed: {}", err);
            }
            println!("{}", serde_json::to_string_pretty(&registry.status(&account))?);
        }
        Commands::Send {
            account,
            to,
            message,
        } => {
            let account = AccountId::new(account);
            let status = registry.connect(&account).await?;
            if !status.is_connected() {
                eprintln!("{} is not paired. Run the pair command first.", account);
                return Ok(());
            }

            let gateway = MessageGateway::new(registry.clone());
            match gateway.send_text(&account, &to, &message).await {
                Ok(receipt) => println!(
                    "Sent {} to {} (correlation {})",
                    receipt.provider_message_id, receipt.recipient, receipt.correlation_id
                ),
                Err(SessionError::InvalidRecipient(phone)) => {
                    eprintln!("Cannot send to {}: not a valid phone number.", phone);
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }

            for _ in 0..20 {
                if !tracker.inbound_events().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            for (_, record) in tracker.outbound_records() {
                println!("{}", serde_json::to_string(&record)?);
            }
            for (_, event) in tracker.inbound_events() {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::Logout { account } => {
            let account = AccountId::new(account);
            registry.logout(&account).await?;
            println!("Logged out {} and removed its credentials.", account);
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(registry.config())?);
        }
    }

    Ok(())
}
