//! idsync command-line client
//!
//! Drives the identity service against a real identity server, keeping all
//! state in a local SQLite file.
//!
//! Usage:
//!   idsync --org myOrg@AdobeOrg sync --id crm=user-1 --auth authenticated
//!   idsync --org myOrg@AdobeOrg privacy optedout
//!   idsync show

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use idsync_cli::{
    HOST_NAMESPACE, HostSettings, build_router, parse_auth_state, parse_key_value, wait_for_drain,
};
use idsync_engine::{
    EngineConfig, EngineEvent, IdentityHandle, IdentityService, RemoteConfig, ReqwestTransport,
    ServiceOptions, SyncRequest,
};
use idsync_storage::{SqliteHitStore, SqliteKeyValueStore};
use idsync_types::{AuthenticationState, IdentitySnapshot, PrivacyStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "idsync")]
#[command(about = "Identity sync client")]
struct Args {
    /// SQLite file holding the identity record and hit queue
    #[arg(long, default_value = "idsync.db")]
    db: PathBuf,

    /// Organization id
    #[arg(long)]
    org: Option<String>,

    /// Identity server host (defaults to dpm.demdex.net)
    #[arg(long)]
    server: Option<String>,

    /// Seconds to wait for queued hits to be delivered
    #[arg(long, default_value = "10")]
    wait_secs: u64,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// Another component sends opt-out requests
    #[arg(long)]
    opt_out_handled_elsewhere: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record identifiers and sync them
    Sync {
        /// Custom identifier as TYPE=VALUE (repeatable)
        #[arg(long = "id", value_parser = parse_key_value)]
        ids: Vec<(String, String)>,

        /// Authentication state for the identifiers
        #[arg(long, value_parser = parse_auth_state, default_value = "unknown")]
        auth: AuthenticationState,

        /// Device advertising id
        #[arg(long)]
        ad_id: Option<String>,

        /// Push token
        #[arg(long)]
        push_token: Option<String>,

        /// External id as NAMESPACE=VALUE (repeatable)
        #[arg(long = "dpid", value_parser = parse_key_value)]
        dpids: Vec<(String, String)>,

        /// Sync even if nothing changed
        #[arg(long)]
        force: bool,
    },
    /// Set the privacy status (optedin, optedout, unknown)
    Privacy { status: PrivacyStatus },
    /// Forget all identities and sync a new primary id
    Reset,
    /// Print the current identity snapshot
    Show,
    /// Print a URL decorated with the visitor payload
    Url {
        base_url: String,

        /// Analytics id to include
        #[arg(long)]
        aid: Option<String>,

        /// Analytics visitor id to include
        #[arg(long)]
        vid: Option<String>,
    },
    /// Serve the identity snapshot over HTTP
    Serve {
        #[arg(short, long, default_value = "4002")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = EngineConfig {
        timeout_ms: args.timeout_ms,
        ..EngineConfig::default()
    };
    let store = Arc::new(
        SqliteKeyValueStore::open(&args.db, &config.datastore_name)
            .with_context(|| format!("Failed to open identity store at {:?}", args.db))?,
    );
    let hits = Arc::new(
        SqliteHitStore::open(&args.db, &config.datastore_name).context("Failed to open hit queue")?,
    );
    let settings = Arc::new(HostSettings::new(Arc::new(
        SqliteKeyValueStore::open(&args.db, HOST_NAMESPACE)
            .context("Failed to open host settings")?,
    )));
    let transport = Arc::new(ReqwestTransport::new(config.timeout())?);
    let timeout = config.timeout();

    let options = ServiceOptions {
        opt_out_handled_elsewhere: args.opt_out_handled_elsewhere,
    };
    let (handle, events) =
        IdentityService::spawn_with_options(config, options, store, hits, transport);
    tokio::spawn(log_events(events, Arc::clone(&settings)));

    let privacy = match &args.command {
        Command::Privacy { status } => *status,
        _ => settings.privacy().context("Failed to read privacy status")?,
    };
    let remote = RemoteConfig {
        org_id: args.org.clone(),
        server: args.server.clone(),
        privacy: Some(privacy),
    };
    let wait = Duration::from_secs(args.wait_secs);

    let result = run(&args, &handle, remote, wait, timeout, &settings).await;
    handle.shutdown().await?;
    result
}

async fn run(
    args: &Args,
    handle: &IdentityHandle,
    remote: RemoteConfig,
    wait: Duration,
    timeout: Duration,
    settings: &HostSettings,
) -> Result<()> {
    match &args.command {
        Command::Show => {
            print_snapshot(&handle.snapshot().await?)?;
        }
        Command::Sync { ids, auth, ad_id, push_token, dpids, force } => {
            if !remote.is_valid() {
                bail!("--org is required to sync identities");
            }
            let mut request = SyncRequest::new().with_auth_state(*auth);
            for (id_type, value) in ids {
                request = request.with_identifier(id_type, value);
            }
            for (namespace, value) in dpids {
                request = request.with_external_id(namespace, value);
            }
            if let Some(ad_id) = ad_id {
                request = request.with_advertising_id(ad_id);
            }
            if let Some(token) = push_token {
                request = request.with_push_token(token);
            }
            if *force {
                request = request.forced();
            }

            handle.update_configuration(remote.clone()).await?;
            if handle.sync_identifiers(request, None).await?.is_none() {
                warn!(privacy = %remote.privacy_status(), "sync request was not accepted");
            }
            report_pending(handle, &remote, wait).await?;
            print_snapshot(&handle.snapshot().await?)?;
        }
        Command::Privacy { status } => {
            handle.update_configuration(remote.clone()).await?;
            settings.set_privacy(*status).context("Failed to save privacy status")?;
            info!(%status, "privacy status applied");
            if status.is_opted_out() {
                // the opt-out request is fire-and-forget; give it a chance to leave
                tokio::time::sleep(timeout).await;
            } else {
                report_pending(handle, &remote, wait).await?;
            }
            print_snapshot(&handle.snapshot().await?)?;
        }
        Command::Reset => {
            handle.update_configuration(remote.clone()).await?;
            if handle.reset_identities().await?.is_none() {
                warn!("identities are not reset while opted out");
            }
            report_pending(handle, &remote, wait).await?;
            print_snapshot(&handle.snapshot().await?)?;
        }
        Command::Url { base_url, aid, vid } => {
            handle.update_configuration(remote).await?;
            let url = handle
                .append_visitor_info(base_url.as_str(), aid.clone(), vid.clone())
                .await?;
            println!("{url}");
        }
        Command::Serve { port } => {
            handle.update_configuration(remote).await?;
            let app = build_router(handle.clone());
            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .with_context(|| format!("Failed to bind HTTP port {port}"))?;
            info!("HTTP identity endpoint listening on port {}", port);
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "failed to listen for ctrl-c");
                    }
                })
                .await
                .context("HTTP server failed")?;
        }
    }
    Ok(())
}

async fn report_pending(
    handle: &IdentityHandle,
    remote: &RemoteConfig,
    wait: Duration,
) -> Result<()> {
    if remote.privacy_status() != PrivacyStatus::OptedIn {
        let queued = handle.queued_hits().await?;
        if queued > 0 {
            info!(queued, "hits are held until privacy is opted in");
        }
        return Ok(());
    }
    let remaining = wait_for_drain(handle, wait).await?;
    if remaining > 0 {
        warn!(remaining, "hits still queued; they will be retried on the next run");
    }
    Ok(())
}

fn print_snapshot(snapshot: &IdentitySnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<EngineEvent>, settings: Arc<HostSettings>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Response { event_ref, snapshot } => {
                debug!(%event_ref, mid = ?snapshot.primary_id, "identity response");
            }
            EngineEvent::PushStatusChanged { enabled } => {
                info!(enabled, "push status changed");
            }
            EngineEvent::ConfigurationUpdate { privacy } => {
                info!(%privacy, "identity service requested a privacy change");
                if let Err(e) = settings.set_privacy(privacy) {
                    warn!(error = %e, "failed to save privacy status");
                }
            }
            other => debug!(event = ?other, "identity event"),
        }
    }
}
