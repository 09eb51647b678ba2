use std::sync::Arc;

use anyhow::Result;
use common::config::{Config, DataPaths};
use common::db::AsyncDb;
use common::transport::{InboundEvent, Outbound, OutboundEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wordchain::dict::WordIndex;
use wordchain::rules::PhoneticRules;
use wordchain::session::SessionManager;

mod commands;
mod effects;
mod llm;
mod metrics;
mod presence;
mod scheduler;
mod websync;
mod wordgame;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(&config.general.log_level)
        .json()
        .init();

    tracing::info!("abydos bot starting");

    let paths = DataPaths::new(&config.general.data_dir);
    paths.ensure_dirs()?;

    metrics::install_prometheus(config.general.prometheus_port)?;
    metrics::describe();

    let db_path = paths.db_file();
    let db = AsyncDb::open(db_path.to_str().unwrap_or("data/storage/bot.db")).await?;

    // Refresh the dictionary cache before indexing; any failure just means
    // we play from the bundled files.
    let sync = wordchain::sync::sync_wordlists(
        config.dictionary.base_url.as_deref(),
        config.dictionary.token.as_deref(),
        &paths,
        false,
    )
    .await;
    tracing::info!(synced = sync.synced, reason = %sync.reason, "wordlist sync");

    let word_paths = wordchain::sync::effective_word_paths(&paths);
    let word_paths: Vec<&std::path::Path> = word_paths.iter().map(std::path::PathBuf::as_path).collect();
    let words = Arc::new(match WordIndex::load_files(&word_paths) {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!(error = %e, "no dictionary available; word games disabled until files appear");
            WordIndex::default()
        }
    });
    let rules = Arc::new(PhoneticRules::load_from_file(&paths.phonetic_rules_file()));
    let suggestions = WordIndex::load_file(&wordchain::sync::effective_suggestion_path(&paths))
        .unwrap_or_default();
    tracing::info!(words = words.len(), suggestions = suggestions.len(), "dictionary loaded");

    let llm_budget = llm::LlmBudget::load(paths.llm_usage_file(), config.llm.clone());
    tracing::info!(
        remaining_usd = llm_budget.remaining_usd(),
        month = %llm_budget.summary().month,
        "llm budget loaded"
    );

    let (out, mut out_rx) = Outbound::channel();
    let cancel = CancellationToken::new();

    // Outbound drain: this is the seam where a concrete chat transport
    // plugs in. Until one is attached, events are logged and dropped.
    tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            match event {
                OutboundEvent::Say { channel_id, text } => {
                    tracing::info!(channel_id, text = %text, "outbound say");
                }
                OutboundEvent::Presence { kind, text } => {
                    tracing::info!(?kind, text = %text, "outbound presence");
                }
                OutboundEvent::MatchReport(payload) => {
                    tracing::info!(payload = %payload, "outbound match report");
                }
            }
        }
    });

    let wordgame = Arc::new(wordgame::WordGame {
        db: db.clone(),
        out: out.clone(),
        sessions: SessionManager::new(),
        words,
        rules,
        suggestions,
    });

    let app = Arc::new(commands::App {
        db: db.clone(),
        out: out.clone(),
        wordgame,
        xp: abydos::xp::XpEngine::new(),
        glitch: config.glitch.clone(),
        prefix: config.transport.command_prefix.clone(),
    });

    // Inbound seam: the transport adapter owns the sender half.
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundEvent>();
    {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                match event {
                    InboundEvent::Message(msg) => app.handle_message(&msg).await,
                    InboundEvent::Interaction(i) => app.handle_interaction(&i).await,
                }
            }
        });
    }

    // Background world loops. Each owns its cadence and honors shutdown.
    tokio::spawn(abydos::world::run_loop(
        db.clone(),
        out.clone(),
        config.world.announce_channel_id,
        cancel.clone(),
    ));
    tokio::spawn(abydos::incidents::run_loop(
        db.clone(),
        out.clone(),
        cancel.clone(),
    ));
    tokio::spawn(abydos::report::run_loop(
        db.clone(),
        out.clone(),
        cancel.clone(),
    ));
    tokio::spawn(presence::run_loop(
        paths.status_messages_file(),
        out.clone(),
        cancel.clone(),
    ));

    // Fixed-interval jobs ride the tick pacers.
    let (websync_tx, mut websync_rx) = mpsc::channel::<()>(8);
    let (wordlist_tx, mut wordlist_rx) = mpsc::channel::<()>(8);
    let _pacer_handles = scheduler::spawn_pacers(
        vec![
            scheduler::TickJob {
                name: "websync",
                every: std::time::Duration::from_secs(config.websync.interval_secs),
                tick: websync_tx,
                immediate: false,
            },
            scheduler::TickJob {
                name: "wordlist_refresh",
                every: std::time::Duration::from_secs(6 * 3600),
                tick: wordlist_tx,
                immediate: false,
            },
        ],
        cancel.clone(),
    );

    {
        let db = db.clone();
        let websync_cfg = config.websync.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            while websync_rx.recv().await.is_some() {
                let (Some(url), Some(token)) = (websync_cfg.url.as_deref(), websync_cfg.token.as_deref())
                else {
                    continue;
                };
                let ok = websync::sync_once(
                    &client,
                    &db,
                    url,
                    token,
                    websync::BotIdentity::default(),
                    vec![],
                )
                .await;
                tracing::debug!(ok, "websync tick done");
            }
        });
    }

    {
        let dictionary = config.dictionary.clone();
        let paths = paths.clone();
        tokio::spawn(async move {
            while wordlist_rx.recv().await.is_some() {
                let outcome = wordchain::sync::sync_wordlists(
                    dictionary.base_url.as_deref(),
                    dictionary.token.as_deref(),
                    &paths,
                    false,
                )
                .await;
                if !outcome.changed_lists.is_empty() {
                    // The in-memory index picks the new files up on restart.
                    tracing::info!(changed = ?outcome.changed_lists, "wordlist cache refreshed");
                }
            }
        });
    }

    // Keep the inbound seam alive until shutdown.
    let _inbound_tx = inbound_tx;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();

    Ok(())
}
