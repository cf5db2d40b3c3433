use crate::state::AppState;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Cada `interval` devuelve a la cola los mensajes cuyo consumidor no hizo
/// ack a tiempo (worker caído o colgado).
pub async fn monitor_leases(state: AppState, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        match state.bus.requeue_expired(Instant::now()) {
            Ok(0) => {}
            Ok(n) => info!("{} mensajes con lease vencido volvieron a su cola", n),
            Err(e) => warn!("error revisando leases: {:#}", e),
        }
    }
}
