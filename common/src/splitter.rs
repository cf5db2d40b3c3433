use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::info;

use crate::bus::MessageBus;
use crate::config::WORK_QUEUE;
use crate::kind::AnalysisKind;
use crate::message::{Params, SectionId, TaskId, TaskMessage};
use crate::store::TextStore;

/// Resumen de una tarea publicada.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTask {
    pub task_id: TaskId,
    pub text: String,
    pub kind: AnalysisKind,
    pub total_sections: u64,
    pub batches: usize,
    pub start_time: i64,
}

/// Parte los ids de un texto en lotes consecutivos de `batch_size`.
/// Todos comparten task id, tipo, params y total; cada uno lleva su índice.
pub fn plan_batches(
    task_id: TaskId,
    kind: AnalysisKind,
    params: &Params,
    section_ids: &[SectionId],
    batch_size: usize,
    start_time: i64,
) -> Vec<TaskMessage> {
    let total_sections = section_ids.len() as u64;

    section_ids
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| TaskMessage {
            task_id,
            kind,
            section_ids: chunk.to_vec(),
            total_sections,
            params: params.clone(),
            batch_index: Some(i as u32),
            start_time,
        })
        .collect()
}

/// Crea una tarea para `text` y publica todos sus lotes en la cola de trabajo.
pub async fn submit_task(
    bus: &dyn MessageBus,
    store: &dyn TextStore,
    text: &str,
    kind: AnalysisKind,
    params: Params,
    batch_size: usize,
) -> Result<SubmittedTask> {
    if !kind.is_known() {
        bail!("tipo de análisis desconocido");
    }

    let section_ids = store
        .section_ids(text)
        .await
        .with_context(|| format!("buscando secciones de '{text}'"))?;
    if section_ids.is_empty() {
        bail!("el texto '{text}' no tiene secciones");
    }

    let task_id = store.next_task_id().await.context("pidiendo task id")?;
    let start_time = Utc::now().timestamp_millis();

    let batches = plan_batches(task_id, kind, &params, &section_ids, batch_size, start_time);

    info!(
        "[TASK START] task {} ({}) para '{}': {} secciones en {} lotes",
        task_id,
        kind,
        text,
        section_ids.len(),
        batches.len()
    );

    let count = batches.len();
    for batch in batches {
        bus.publish(WORK_QUEUE, batch.to_json())
            .await
            .with_context(|| format!("publicando lote de task {task_id}"))?;
    }

    Ok(SubmittedTask {
        task_id,
        text: text.to_string(),
        kind,
        total_sections: section_ids.len() as u64,
        batches: count,
        start_time,
    })
}
