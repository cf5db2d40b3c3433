use anyhow::{Context, Result};
use common::{
    Aggregator, Delivery, HttpBus, MessageBus, Progress, ResultMessage, Settings, RESULTS_QUEUE,
    SINK_QUEUE,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Intentos de publicar un resultado agregado antes de rendirse.
const SINK_PUBLISH_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Tiempos del loop del aggregator.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub poll_timeout: Duration,
    pub sweep_interval: Duration,
    pub task_ttl: Duration,
}

impl From<&Settings> for LoopConfig {
    fn from(s: &Settings) -> Self {
        Self {
            poll_timeout: s.poll_timeout,
            sweep_interval: s.sweep_interval,
            task_ttl: s.task_ttl,
        }
    }
}

/// Entrega un parcial al motor y, si la tarea se completó, publica el
/// resultado agregado. Devuelve el progreso para logs y tests; `Err` solo si
/// el resultado no llegó al sink (la tarea queda como antes del parcial).
pub async fn handle_delivery(
    bus: &dyn MessageBus,
    engine: &mut Aggregator,
    delivery: &Delivery,
    now: Instant,
) -> Result<Option<Progress>> {
    let partial = match ResultMessage::from_json(&delivery.body) {
        Ok(p) => p,
        Err(e) => {
            error!("resultado parcial inválido (tag {}): {}", delivery.tag, e);
            return Ok(None);
        }
    };

    let task_id = partial.task_id;
    let kind = partial.kind;
    let progress = match engine.on_partial_result(partial, now) {
        Ok(p) => p,
        Err(e) => {
            error!("task {} ({}): {}, parcial descartado", task_id, kind, e);
            return Ok(None);
        }
    };

    match &progress {
        Progress::InFlight { received, total } => {
            info!("task {} ({}): {}/{} secciones", task_id, kind, received, total);
        }
        Progress::Complete(result) => {
            if let Err(e) = publish_final(bus, result).await {
                engine.rollback(task_id);
                return Err(e);
            }
            engine.commit(task_id, now);
            info!(
                "[TASK COMPLETE] task {} ({}): {} secciones",
                task_id, kind, result.sections_count
            );
        }
        Progress::Duplicate => debug!("task {}: lote repetido, se ignora", task_id),
        Progress::Late => debug!("task {}: parcial tardío de una tarea ya emitida", task_id),
    }

    Ok(Some(progress))
}

async fn publish_final(bus: &dyn MessageBus, result: &ResultMessage) -> Result<()> {
    let body = result.to_json();
    let mut attempt = 1;
    loop {
        match bus.publish(SINK_QUEUE, body.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < SINK_PUBLISH_ATTEMPTS => {
                warn!(
                    "publicando task {} al sink (intento {}/{}): {:#}",
                    result.task_id, attempt, SINK_PUBLISH_ATTEMPTS, e
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e.context(format!(
                    "task {}: el sink no aceptó el resultado tras {} intentos",
                    result.task_id, SINK_PUBLISH_ATTEMPTS
                )))
            }
        }
    }
}

/// Loop único dueño del `Aggregator`: recibe parciales, los agrega y barre
/// tareas viejas cada `sweep_interval`. Un error de transporte con el master
/// termina el loop; el parcial en curso se devuelve a la cola.
pub async fn run_loop(
    bus: Arc<dyn MessageBus>,
    config: LoopConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<Aggregator> {
    let mut engine = Aggregator::new();
    let mut last_sweep = Instant::now();

    info!("aggregator escuchando {}", RESULTS_QUEUE);

    while !*shutdown.borrow() {
        if last_sweep.elapsed() >= config.sweep_interval {
            let evicted = engine.sweep_stale(Instant::now(), config.task_ttl);
            if !evicted.is_empty() {
                warn!("tareas descartadas por TTL: {:?}", evicted);
            }
            last_sweep = Instant::now();
        }

        let Some(delivery) = bus
            .receive(RESULTS_QUEUE, config.poll_timeout)
            .await
            .with_context(|| format!("recibiendo de {RESULTS_QUEUE}"))?
        else {
            continue;
        };

        if let Err(e) = handle_delivery(bus.as_ref(), &mut engine, &delivery, Instant::now()).await
        {
            if let Err(nack) = bus.nack(RESULTS_QUEUE, delivery.tag, true).await {
                warn!("no se pudo devolver tag {}: {:#}", delivery.tag, nack);
            }
            return Err(e);
        }

        if let Err(e) = bus.ack(RESULTS_QUEUE, delivery.tag).await {
            // lease vencido: la reentrega vuelve como Duplicate o Late
            warn!("no se pudo confirmar tag {}: {:#}", delivery.tag, e);
        }
    }

    info!("aggregator detenido con {} tareas pendientes", engine.pending());
    Ok(engine)
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("aggregator=debug,common=info")),
        )
        .init();

    let settings = Settings::from_env();
    let http = HttpBus::new(settings.master_url.clone());
    http.health().await?;
    info!("aggregator contra {}", settings.master_url);

    let bus: Arc<dyn MessageBus> = Arc::new(http);
    let (tx, rx) = watch::channel(false);
    let mut handle = tokio::spawn(run_loop(bus, LoopConfig::from(&settings), rx));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("aggregator: ctrl-c recibido");
            let _ = tx.send(true);
            handle.await??;
        }
        res = &mut handle => {
            res??;
        }
    }
    Ok(())
}
