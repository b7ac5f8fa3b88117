use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tallyd::auth::AuthStore;
use tallyd::cache::AggregationCache;
use tallyd::config::Config;
use tallyd::persistence::PersistenceStore;
use tallyd::server::{self, AppState};
use tallyd::timeseries::{Day, TimeSeriesStore};
use tracing::{error, info, warn};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

/// Replays `users.dat`, the rotation state header, and the last `memory_days`
/// completed day files into fresh in-memory structures. Missing files mean a
/// first run and are not an error.
fn recover(config: &Config, persistence: &PersistenceStore, auth: &AuthStore) -> Result<(i32, VecDeque<Day>)> {
    let users = persistence.load_users().context("loading users.dat")?;
    for user in users {
        auth.register_prehashed(&user.username, user.password_hash);
    }

    let current_day_id = persistence.load_state().context("loading rotation state")?.unwrap_or(0);

    let mut history = VecDeque::new();
    let oldest_kept = (current_day_id - config.memory_days as i32).max(0);
    let mut day_id = current_day_id - 1;
    while day_id >= oldest_kept {
        let events = persistence.load_day(day_id).with_context(|| format!("loading day-{day_id}.dat"))?;
        history.push_back(Day { day_id, events, start_time: 0, completed: true });
        day_id -= 1;
    }

    Ok((current_day_id, history))
}

fn run_admin_console(state: Arc<AppState>, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        match line.trim() {
            "newday" => match state.ts.new_day() {
                Ok(()) => info!("rotated to a new day"),
                Err(e) => error!(error = %e, "new-day command failed"),
            },
            "save" => match state.save() {
                Ok(()) => info!("saved users and rotation state"),
                Err(e) => error!(error = %e, "save command failed"),
            },
            "stats" => info!(
                current_day_id = state.ts.current_day_id(),
                historical_days = state.ts.historical_day_count(),
                "stats"
            ),
            "quit" => {
                if let Err(e) = state.save() {
                    error!(error = %e, "save on quit failed");
                }
                shutdown.store(true, Ordering::SeqCst);
                std::process::exit(0);
            }
            "help" => println!("commands: newday | stats | save | quit | help"),
            "" => {}
            other => println!("unknown command {other:?}, try 'help'"),
        }
    }
}

fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let config = Config::parse();
    config.validate().map_err(anyhow::Error::msg)?;

    let persistence = Arc::new(PersistenceStore::new(config.data_dir.clone()));
    let auth = Arc::new(AuthStore::new());
    let cache = Arc::new(AggregationCache::new(config.memory_days));

    let (current_day_id, history) = recover(&config, &persistence, &auth)?;
    info!(current_day_id, historical_days = history.len(), "recovered persisted state");

    let ts = Arc::new(TimeSeriesStore::new(
        config.memory_days,
        config.disk_days,
        Arc::clone(&persistence),
        Arc::clone(&cache),
        current_day_id,
        history,
    ));
    let pool = Arc::new(tallyd::workerpool::WorkerPool::new(config.workers));

    let state = Arc::new(AppState {
        auth: Arc::clone(&auth),
        ts: Arc::clone(&ts),
        cache: Arc::clone(&cache),
        persistence: Arc::clone(&persistence),
        pool: Arc::clone(&pool),
    });

    let shutdown = Arc::new(AtomicBool::new(false));

    {
        let state = Arc::clone(&state);
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            warn!("interrupt received, saving state before exit");
            if let Err(e) = state.save() {
                error!(error = %e, "save on interrupt failed");
            }
            shutdown.store(true, Ordering::SeqCst);
            std::process::exit(0);
        })
        .context("installing ctrl-c handler")?;
    }

    {
        let state = Arc::clone(&state);
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || run_admin_console(state, shutdown));
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port)).with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, data_dir = ?config.data_dir, "tallyd listening");
    server::serve(listener, state, shutdown)?;
    Ok(())
}
