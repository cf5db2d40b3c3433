mod handlers;
mod monitor;
mod state;

use anyhow::{Context, Result};
use common::config::SECTION_SIZE_BYTES;
use common::{MemoryBus, MemoryStore, Settings, TaskSequence};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info,axum=info")),
        )
        .init();

    let settings = Settings::from_env();

    let sequence = match &settings.task_seq_path {
        Some(path) => TaskSequence::open(path.clone())?,
        None => TaskSequence::in_memory(),
    };
    let store = MemoryStore::new(sequence);

    // textos precargados
    if let Some(dir) = &settings.texts_dir {
        match store.load_dir(dir, SECTION_SIZE_BYTES) {
            Ok(loaded) => info!("{} textos cargados desde {}", loaded.len(), dir.display()),
            Err(e) => warn!("no se pudo leer {}: {:#}", dir.display(), e),
        }
    }

    let bus = MemoryBus::new(settings.visibility_timeout, settings.max_delivery_attempts);
    let state = AppState::new(bus, store, SECTION_SIZE_BYTES);

    // router HTTP
    let app = handlers::build_router(state.clone());

    // reentrega de mensajes con lease vencido
    let monitor_state = state.clone();
    let interval = (settings.visibility_timeout / 2).max(std::time::Duration::from_secs(1));
    tokio::spawn(async move {
        monitor::monitor_leases(monitor_state, interval).await;
    });

    let listener = TcpListener::bind(&settings.master_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", settings.master_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("master: ctrl-c recibido, cerrando");
        })
        .await?;

    Ok(())
}
