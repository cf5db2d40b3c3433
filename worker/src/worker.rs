use anyhow::{Context, Result};
use common::{
    handlers, AnalysisError, Delivery, HttpBus, HttpStore, MessageBus, ResultMessage, Settings,
    TaskMessage, TextStore, RESULTS_QUEUE, WORK_QUEUE,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Qué hacer con un mensaje después de procesarlo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Resultado publicado; ack.
    Done,
    /// Mensaje inválido o sin handler; ack y se descarta.
    Dropped,
    /// Falla transitoria; nack con requeue.
    Retry,
}

/// Ejecuta un lote: trae sus secciones y corre el handler del tipo.
/// Un tipo desconocido vuelve como `AnalysisError` dentro del anyhow.
pub async fn process_batch(store: &dyn TextStore, task: &TaskMessage) -> Result<ResultMessage> {
    if !task.kind.is_known() {
        return Err(AnalysisError::UnknownKind.into());
    }

    let sections = store
        .fetch_sections(&task.section_ids)
        .await
        .with_context(|| format!("trayendo secciones de task {}", task.task_id))?;

    let kind = task.kind;
    let params = task.params.clone();
    // el análisis es CPU puro: fuera del runtime
    let payload =
        tokio::task::spawn_blocking(move || handlers::handle(kind, &params, &sections)).await??;

    Ok(ResultMessage {
        task_id: task.task_id,
        kind: task.kind,
        sections_count: task.section_ids.len() as u64,
        total_sections: task.total_sections,
        params: task.params.clone(),
        batch_index: task.batch_index,
        start_time: task.start_time,
        payload,
    })
}

/// Procesa una entrega y publica el resultado parcial. No hace ack.
pub async fn handle_delivery(
    bus: &dyn MessageBus,
    store: &dyn TextStore,
    delivery: &Delivery,
) -> Disposition {
    let task = match TaskMessage::from_json(&delivery.body) {
        Ok(t) => t,
        Err(e) => {
            error!("mensaje de tarea inválido (tag {}): {}", delivery.tag, e);
            return Disposition::Dropped;
        }
    };

    if delivery.attempt > 1 {
        info!(
            "reentrega #{} de task {} lote {:?}",
            delivery.attempt, task.task_id, task.batch_index
        );
    }

    let result = match process_batch(store, &task).await {
        Ok(r) => r,
        Err(e) if e.downcast_ref::<AnalysisError>().is_some() => {
            error!("task {} ({}): {:#}, se descarta", task.task_id, task.kind, e);
            return Disposition::Dropped;
        }
        Err(e) => {
            warn!("task {} lote {:?} falló: {:#}", task.task_id, task.batch_index, e);
            return Disposition::Retry;
        }
    };

    if let Err(e) = bus.publish(RESULTS_QUEUE, result.to_json()).await {
        warn!("no se pudo publicar resultado de task {}: {:#}", task.task_id, e);
        return Disposition::Retry;
    }

    debug!(
        "task {} lote {:?}: {} secciones procesadas",
        task.task_id, task.batch_index, result.sections_count
    );
    Disposition::Done
}

/// Loop de un consumidor: recibe, procesa, confirma. Sale cuando `shutdown`
/// pasa a `true`; un lote en curso se termina antes de salir. Si el master no
/// contesta a `receive`, devuelve el error.
pub async fn run_consumer(
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn TextStore>,
    consumer: String,
    poll_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("consumidor {} escuchando {}", consumer, WORK_QUEUE);

    while !*shutdown.borrow() {
        let Some(delivery) = bus
            .receive(WORK_QUEUE, poll_timeout)
            .await
            .with_context(|| format!("{consumer}: recibiendo de {WORK_QUEUE}"))?
        else {
            continue;
        };

        let outcome = match handle_delivery(bus.as_ref(), store.as_ref(), &delivery).await {
            Disposition::Done | Disposition::Dropped => bus.ack(WORK_QUEUE, delivery.tag).await,
            Disposition::Retry => bus.nack(WORK_QUEUE, delivery.tag, true).await,
        };
        if let Err(e) = outcome {
            // el lease vence y el mensaje vuelve solo
            warn!("{}: no se pudo confirmar tag {}: {:#}", consumer, delivery.tag, e);
        }
    }

    info!("consumidor {} detenido", consumer);
    Ok(())
}

/// Arranca `WORKER_CONCURRENCY` consumidores contra el master y espera a
/// ctrl-c para cerrarlos. Si un consumidor cae, se cierran todos y el proceso
/// sale con su error.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,common=info,reqwest=info")),
        )
        .init();

    let settings = Settings::from_env();
    let http = HttpBus::new(settings.master_url.clone());
    http.health().await?;

    let bus: Arc<dyn MessageBus> = Arc::new(http);
    let store: Arc<dyn TextStore> = Arc::new(HttpStore::new(settings.master_url.clone()));

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let worker_id = format!("{}-{}", hostname, uuid::Uuid::new_v4());

    info!(
        "worker {} con concurrency={} contra {}",
        worker_id, settings.worker_concurrency, settings.master_url
    );

    let (tx, rx) = watch::channel(false);
    let mut consumers = JoinSet::new();
    for slot in 0..settings.worker_concurrency {
        consumers.spawn(run_consumer(
            bus.clone(),
            store.clone(),
            format!("{worker_id}#{slot}"),
            settings.poll_timeout,
            rx.clone(),
        ));
    }

    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            info!("worker: ctrl-c recibido, terminando lotes en curso");
            res.map_err(anyhow::Error::from)
        }
        Some(joined) = consumers.join_next() => {
            error!("un consumidor se detuvo, cerrando el worker");
            joined.map_err(anyhow::Error::from).and_then(|r| r)
        }
    };
    let _ = tx.send(true);

    while let Some(joined) = consumers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("consumidor terminó con error: {:#}", e),
            Err(e) => warn!("consumidor terminó con error: {:?}", e),
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use common::{AnalysisKind, DeliveryTag, MemoryBus, MemoryStore, Params, Payload};

    /// Master inalcanzable: toda operación falla.
    struct DownBus;

    #[async_trait]
    impl MessageBus for DownBus {
        async fn publish(&self, _queue: &str, _body: String) -> Result<()> {
            bail!("conexión rechazada")
        }

        async fn receive(&self, _queue: &str, _timeout: Duration) -> Result<Option<Delivery>> {
            bail!("conexión rechazada")
        }

        async fn ack(&self, _queue: &str, _tag: DeliveryTag) -> Result<()> {
            bail!("conexión rechazada")
        }

        async fn nack(&self, _queue: &str, _tag: DeliveryTag, _requeue: bool) -> Result<()> {
            bail!("conexión rechazada")
        }
    }

    fn setup() -> (Arc<MemoryBus>, Arc<MemoryStore>) {
        let bus = Arc::new(MemoryBus::new(Duration::from_secs(30), 3));
        let store = Arc::new(MemoryStore::default());
        store.insert_text("t", "uno dos tres cuatro", 8).unwrap();
        (bus, store)
    }

    fn task(store: &MemoryStore, kind: AnalysisKind) -> TaskMessage {
        let ids = store.ids_of("t").unwrap();
        TaskMessage {
            task_id: 9,
            kind,
            total_sections: ids.len() as u64,
            section_ids: ids,
            params: Params::default(),
            batch_index: Some(0),
            start_time: 1,
        }
    }

    #[tokio::test]
    async fn process_batch_cuenta_palabras_del_lote() {
        let (_, store) = setup();
        let t = task(&store, AnalysisKind::WordCount);

        let r = process_batch(store.as_ref(), &t).await.unwrap();
        assert_eq!(r.task_id, 9);
        assert_eq!(r.sections_count, t.section_ids.len() as u64);
        assert_eq!(r.total_sections, t.total_sections);
        assert_eq!(r.batch_index, Some(0));
        // las secciones de 8 bytes pueden partir palabras; el texto entero no
        let whole = handlers::handle(
            AnalysisKind::WordCount,
            &Params::default(),
            &store.sections(&t.section_ids).unwrap(),
        )
        .unwrap();
        assert_eq!(r.payload, whole);
    }

    #[tokio::test]
    async fn entrega_valida_publica_resultado() {
        let (bus, store) = setup();
        let d = Delivery {
            tag: 1,
            body: task(&store, AnalysisKind::Tonality).to_json(),
            attempt: 1,
        };

        assert_eq!(handle_delivery(bus.as_ref(), store.as_ref(), &d).await, Disposition::Done);

        let out = bus
            .receive(RESULTS_QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let r = ResultMessage::from_json(&out.body).unwrap();
        assert_eq!(r.kind, AnalysisKind::Tonality);
        assert!(matches!(r.payload, Payload::Tonality(_)));
    }

    #[tokio::test]
    async fn tipo_desconocido_o_json_roto_se_descartan() {
        let (bus, store) = setup();

        let unknown = Delivery {
            tag: 1,
            body: r#"{"task_id": 1, "type": "frobnicate", "section_ids": [1]}"#.into(),
            attempt: 1,
        };
        assert_eq!(
            handle_delivery(bus.as_ref(), store.as_ref(), &unknown).await,
            Disposition::Dropped
        );

        let garbage = Delivery { tag: 2, body: "{no es json".into(), attempt: 1 };
        assert_eq!(
            handle_delivery(bus.as_ref(), store.as_ref(), &garbage).await,
            Disposition::Dropped
        );

        assert!(bus
            .receive(RESULTS_QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn seccion_faltante_pide_reintento() {
        let (bus, store) = setup();
        let mut t = task(&store, AnalysisKind::WordCount);
        t.section_ids.push(12345);
        let d = Delivery { tag: 1, body: t.to_json(), attempt: 1 };

        assert_eq!(handle_delivery(bus.as_ref(), store.as_ref(), &d).await, Disposition::Retry);
    }

    #[tokio::test]
    async fn consumidor_procesa_y_se_detiene() {
        let (bus, store) = setup();
        bus.publish(WORK_QUEUE, task(&store, AnalysisKind::WordCount).to_json())
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_consumer(
            bus.clone(),
            store.clone(),
            "test#0".into(),
            Duration::from_millis(10),
            rx,
        ));

        let out = bus
            .receive(RESULTS_QUEUE, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultMessage::from_json(&out.body).unwrap().task_id, 9);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // la tarea quedó confirmada
        assert_eq!(bus.stats(WORK_QUEUE).unwrap().unacked, 0);
    }

    #[tokio::test]
    async fn consumidor_termina_si_el_master_no_responde() {
        let (_, store) = setup();
        let (_tx, rx) = watch::channel(false);

        let res = tokio::time::timeout(
            Duration::from_secs(2),
            run_consumer(Arc::new(DownBus), store, "test#1".into(), Duration::from_millis(10), rx),
        )
        .await
        .unwrap();
        let err = res.unwrap_err();
        assert!(format!("{err:#}").contains("conexión rechazada"));
    }
}
