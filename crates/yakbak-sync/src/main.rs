//! yakbak feed command line client.
//!
//! Opens a feed over the local cache and the network, prints what is visible,
//! optionally pages backwards and follows the live tail.
//!
//! # Usage
//!
//! ```bash
//! # Global feed, two extra pages, then follow new notes
//! yakbak-feed --pages 2 --tail
//!
//! # One author, or everyone an author follows
//! yakbak-feed --author npub1...
//! yakbak-feed --follow npub1...
//!
//! # Hashtags or a single relay
//! yakbak-feed --hashtag "#music, podcast"
//! yakbak-feed --relay relay.damus.io
//!
//! # Replies to a note, or the notifications of a user
//! yakbak-feed --replies <event id hex>
//! yakbak-feed --notifications npub1... --tail
//! ```
//!
//! # Graceful Shutdown
//!
//! Ctrl+C stops the live tail, flushes watermarks and disconnects.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use yakbak_core::metrics::{init_metrics, start_metrics_server};
use yakbak_core::{CONTACT_LIST_KIND, Filter, ParticipantId, Record, RecordId, parse_hashtags};
use yakbak_sync::relay_url::normalize_list;
use yakbak_sync::selection::GLOBAL_RELAYS;
use yakbak_sync::{
    EngineDeps, Fanout, FeedUpdate, FeedView, NostrTransport, NostrTransportConfig,
    NotificationCenter, OutboxDirectory, Selection, SqliteEventCache, SyncConfig, SyncEngine,
    SystemClock, ThreadLoader, WatermarkTable,
};

/// yakbak feed client.
#[derive(Parser, Debug)]
#[command(name = "yakbak-feed")]
#[command(about = "Sync and print a yakbak voice note feed")]
#[command(version)]
struct Args {
    /// SQLite cache path
    #[arg(long, default_value = "./data/yakbak.db")]
    db_path: PathBuf,

    /// Fallback relays for participants without a relay list (comma-separated)
    #[arg(long, value_delimiter = ',')]
    relays: Option<Vec<String>>,

    /// Show one author's notes (hex or npub)
    #[arg(long)]
    author: Option<String>,

    /// Show notes from everyone this user follows (hex or npub)
    #[arg(long)]
    follow: Option<String>,

    /// Show notes with these hashtags
    #[arg(long)]
    hashtag: Option<String>,

    /// Show everything one relay carries
    #[arg(long)]
    relay: Option<String>,

    /// Print replies to this note and exit
    #[arg(long)]
    replies: Option<String>,

    /// Print notifications for this user (hex or npub)
    #[arg(long)]
    notifications: Option<String>,

    /// Extra pages to load after the first
    #[arg(long, default_value = "0")]
    pages: usize,

    /// Keep running and print live records
    #[arg(long)]
    tail: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,yakbak_sync=debug")),
        )
        .init();

    let args = Args::parse();
    let config = SyncConfig::from_env().context("Invalid YAKBAK_* configuration")?;

    if args.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(args.metrics_port, handle).await?;
    }

    let shutdown = CancellationToken::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping...");
        handler_shutdown.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    if let Some(parent) = args.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let cache = Arc::new(
        SqliteEventCache::open(&args.db_path)
            .with_context(|| format!("Failed to open cache at {}", args.db_path.display()))?,
    );
    let watermarks = Arc::new(WatermarkTable::load(cache.clone())?);

    let fallback = match &args.relays {
        Some(relays) => normalize_list(relays.iter().map(String::as_str), usize::MAX),
        None => normalize_list(GLOBAL_RELAYS.iter().copied(), usize::MAX),
    };
    if fallback.is_empty() {
        bail!("No usable relay URLs");
    }

    let transport = Arc::new(NostrTransport::new(NostrTransportConfig::default()));
    let fanout = Fanout::new(transport.clone());
    let directory = Arc::new(OutboxDirectory::new(fanout.clone(), &config, fallback.clone()));

    tracing::info!("Configuration:");
    tracing::info!("  Cache: {}", args.db_path.display());
    tracing::info!("  Fallback relays: {}", fallback.len());
    tracing::info!("  Indexer relays: {}", config.indexer_relays.len());
    tracing::info!("  Watermarks: {}", watermarks.len());

    let engine = SyncEngine::new(EngineDeps {
        transport: transport.clone(),
        cache: cache.clone(),
        directory: directory.clone(),
        watermarks: watermarks.clone(),
        clock: Arc::new(SystemClock),
        config: config.clone(),
    });

    let outcome = if let Some(id) = &args.replies {
        let loader = ThreadLoader::new(fanout, cache.clone(), directory, &config, fallback);
        print_replies(&loader, id).await
    } else if let Some(user) = &args.notifications {
        let center = NotificationCenter::new(parse_participant(user)?, engine.deps(), cache.clone())?;
        follow_notifications(&center, args.tail, &shutdown).await
    } else {
        let selection = build_selection(&args, &fanout, &config).await?;
        run_feed(engine, selection, &args, &shutdown).await
    };

    tracing::info!("Shutting down...");
    if let Err(e) = watermarks.flush() {
        tracing::warn!("Failed to flush watermarks: {}", e);
    }
    transport.shutdown().await;
    outcome
}

async fn build_selection(args: &Args, fanout: &Fanout, config: &SyncConfig) -> Result<Selection> {
    if let Some(author) = &args.author {
        return Ok(Selection::profile(parse_participant(author)?));
    }
    if let Some(user) = &args.follow {
        let user = parse_participant(user)?;
        let filter = Filter::new().author(user).kind(CONTACT_LIST_KIND);
        let result = fanout
            .query_required(&config.indexer_relays, &filter, config.query_timeout)
            .await
            .context("Failed to fetch contact list")?;
        let Some(contacts) = result.records.iter().max_by_key(|r| r.created_at) else {
            bail!("No contact list found for {}", user);
        };
        return Ok(Selection::following(contacts));
    }
    if let Some(hashtags) = &args.hashtag {
        let tags = parse_hashtags(hashtags);
        if tags.is_empty() {
            bail!("No hashtags in {:?}", hashtags);
        }
        return Ok(Selection::hashtag(&tags));
    }
    if let Some(relay) = &args.relay {
        return Selection::relay(relay).with_context(|| format!("Invalid relay {:?}", relay));
    }
    Ok(Selection::global())
}

async fn run_feed(
    engine: SyncEngine,
    selection: Selection,
    args: &Args,
    shutdown: &CancellationToken,
) -> Result<()> {
    tracing::info!("Opening feed {}", selection.label);
    let view = FeedView::new(engine, selection);
    let mut updates = view.updates();

    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        _ = view.ready() => {}
    }
    if let Some(error) = view.status().error {
        bail!("Feed stopped: {}", error);
    }

    let mut printed = view.current_visible_records();
    for record in &printed {
        print_record(record);
    }

    for _ in 0..args.pages {
        if !view.is_paginable() {
            break;
        }
        let visible = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            visible = view.show_more() => visible?,
        };
        let records = view.current_visible_records();
        println!("--- {} visible ---", visible);
        for record in records.iter().skip(printed.len()) {
            print_record(record);
        }
        printed = records;
    }

    if !args.tail {
        return Ok(());
    }

    tracing::info!("Following {} (Ctrl+C to stop)", view.selection().label);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            update = updates.recv() => match update {
                Ok(FeedUpdate::Inserted { index, record }) => {
                    print!("+{:<4}", index);
                    print_record(&record);
                }
                Ok(FeedUpdate::Status(status)) => {
                    if let Some(error) = status.error {
                        bail!("Feed stopped: {}", error);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Missed {} feed updates", missed);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn print_replies(loader: &ThreadLoader, id: &str) -> Result<()> {
    let id = RecordId::from_hex(id).with_context(|| format!("Invalid note id {:?}", id))?;
    let parent = loader.fetch_record(&id, &[]).await?;
    let root = loader.fetch_root(&parent, &[]).await?;
    if root.id != parent.id {
        println!("in thread {}", root.id);
    }
    print_record(&parent);
    for reply in loader.load_replies(&parent).await? {
        print!("  ");
        print_record(&reply);
    }
    Ok(())
}

async fn follow_notifications(
    center: &NotificationCenter,
    tail: bool,
    shutdown: &CancellationToken,
) -> Result<()> {
    center.load_stored()?;
    for notification in center.notifications() {
        print!("{} ", if notification.seen { " " } else { "*" });
        print_record(&notification.record);
    }
    println!("--- {} unseen ---", center.unseen_count());

    if !tail {
        return Ok(());
    }
    let mut updates = center.updates();
    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        result = center.run() => result.map_err(Into::into),
        _ = async {
            while let Ok(notification) = updates.recv().await {
                print!("* ");
                print_record(&notification.record);
            }
        } => Ok(()),
    }
}

/// Accept hex keys as well as `npub` bech32.
fn parse_participant(input: &str) -> Result<ParticipantId> {
    let key = nostr_sdk::PublicKey::parse(input.trim())
        .with_context(|| format!("Invalid public key {:?}", input))?;
    Ok(ParticipantId::from_hex(&key.to_hex())?)
}

fn print_record(record: &Record) {
    let when = chrono::DateTime::from_timestamp(record.created_at, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| record.created_at.to_string());
    println!(
        "{} {} {} {}",
        when,
        record.id.short(),
        record.author.short(),
        record.content.lines().next().unwrap_or("")
    );
}
