//! Motor de agregación.
//!
//! Junta los resultados parciales de cada tarea (llegan en cualquier orden,
//! desde cualquier worker), detecta cuándo se vieron todas las secciones y
//! combina los parciales en un único resultado con el reducer del tipo.
//!
//! ## Ciclo de vida de una tarea
//! 1. El primer parcial de un `task_id` nuevo crea su estado.
//! 2. Cada parcial suma su `sections_count`.
//! 3. Cuando la suma alcanza `total_sections` se reduce y se devuelve el
//!    resultado. Recién con `commit` (tras publicarlo) se borra el estado; si
//!    la publicación falla, `rollback` deja la tarea como antes de ese parcial.
//! 4. Las tareas que nunca se completan (lotes perdidos, tipo sin handler) se
//!    eliminan con `sweep_stale` pasado el TTL.
//!
//! El mapa es de un solo dueño (el loop del aggregator), por eso no hay locks.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::TOP_N_CEILING;
use crate::error::AnalysisError;
use crate::handlers::rank_words;
use crate::kind::AnalysisKind;
use crate::message::{Payload, ResultMessage, Sentence, TaskId, ToneTally};

/// Qué pasó con un parcial al entregarlo al motor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// La tarea sigue abierta.
    InFlight { received: u64, total: u64 },
    /// Última pieza: resultado agregado listo para publicar.
    Complete(ResultMessage),
    /// El mismo lote ya había llegado (reentrega).
    Duplicate,
    /// La tarea ya se había emitido; el parcial se descarta.
    Late,
}

#[derive(Debug)]
struct PendingTask {
    kind: AnalysisKind,
    partials: Vec<ResultMessage>,
    received: u64,
    seen_batches: HashSet<u32>,
    first_seen: Instant,
    last_seen: Instant,
}

/// Estado de todas las tareas en vuelo.
#[derive(Debug, Default)]
pub struct Aggregator {
    tasks: HashMap<TaskId, PendingTask>,
    /// Tareas ya emitidas, para no emitirlas dos veces si llega una reentrega.
    finished: HashMap<TaskId, Instant>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cantidad de tareas incompletas en memoria.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn on_partial_result(
        &mut self,
        partial: ResultMessage,
        now: Instant,
    ) -> Result<Progress, AnalysisError> {
        if !partial.kind.is_known() {
            return Err(AnalysisError::UnknownKind);
        }

        let task_id = partial.task_id;
        if self.finished.contains_key(&task_id) {
            return Ok(Progress::Late);
        }

        let entry = self.tasks.entry(task_id).or_insert_with(|| PendingTask {
            kind: partial.kind,
            partials: Vec::new(),
            received: 0,
            seen_batches: HashSet::new(),
            first_seen: now,
            last_seen: now,
        });

        if entry.kind != partial.kind {
            return Err(AnalysisError::KindMismatch {
                task_id,
                expected: entry.kind,
                got: partial.kind,
            });
        }

        if let Some(idx) = partial.batch_index {
            if !entry.seen_batches.insert(idx) {
                return Ok(Progress::Duplicate);
            }
        }

        let total = partial.total_sections;
        entry.received = entry.received.saturating_add(partial.sections_count);
        entry.last_seen = now;
        entry.partials.push(partial);

        if entry.received < total {
            return Ok(Progress::InFlight {
                received: entry.received,
                total,
            });
        }

        debug!(
            task_id,
            partials = entry.partials.len(),
            elapsed_ms = now.saturating_duration_since(entry.first_seen).as_millis() as u64,
            "tarea completa, reduciendo"
        );

        // el estado sigue vivo hasta `commit` o `rollback`
        aggregate(entry.partials.clone()).map(Progress::Complete)
    }

    /// Cierra una tarea cuyo resultado ya se publicó: borra su estado y la
    /// recuerda para que las reentregas vuelvan como `Late`.
    pub fn commit(&mut self, task_id: TaskId, now: Instant) {
        self.tasks.remove(&task_id);
        self.finished.insert(task_id, now);
    }

    /// Deshace el último parcial de una tarea (el que la completó) cuando su
    /// resultado no se pudo publicar. La reentrega de ese parcial la vuelve a
    /// completar.
    pub fn rollback(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if let Some(last) = task.partials.pop() {
            task.received = task.received.saturating_sub(last.sections_count);
            if let Some(idx) = last.batch_index {
                task.seen_batches.remove(&idx);
            }
        }
    }

    /// Elimina tareas sin actividad hace más de `ttl` y olvida tareas emitidas
    /// hace más de `ttl`. Devuelve los ids de las tareas incompletas que se
    /// descartaron.
    pub fn sweep_stale(&mut self, now: Instant, ttl: Duration) -> Vec<TaskId> {
        let mut evicted = Vec::new();

        self.tasks.retain(|task_id, task| {
            if now.saturating_duration_since(task.last_seen) > ttl {
                warn!(
                    task_id,
                    received = task.received,
                    total = task.partials.first().map(|p| p.total_sections).unwrap_or(0),
                    "descartando tarea incompleta por TTL"
                );
                evicted.push(*task_id);
                false
            } else {
                true
            }
        });

        self.finished
            .retain(|_, at| now.saturating_duration_since(*at) <= ttl);

        evicted.sort_unstable();
        evicted
    }
}

/// Combina todos los parciales de una tarea en el resultado final.
/// Todos los parciales comparten tipo; sin parciales no hay tipo y se trata
/// como desconocido.
pub fn aggregate(partials: Vec<ResultMessage>) -> Result<ResultMessage, AnalysisError> {
    let Some(first) = partials.first() else {
        return Err(AnalysisError::UnknownKind);
    };

    let task_id = first.task_id;
    let kind = first.kind;
    let total_sections = first.total_sections;
    let params = first.params.clone();
    let start_time = first.start_time;
    let sections_count = partials
        .iter()
        .map(|p| p.sections_count)
        .fold(0, u64::saturating_add);

    let payload = reduce(kind, params.n, partials)?;

    Ok(ResultMessage {
        task_id,
        kind,
        sections_count,
        total_sections,
        params,
        batch_index: None,
        start_time,
        payload,
    })
}

/// Reducer por tipo: N parciales -> 1 payload.
pub fn reduce(
    kind: AnalysisKind,
    n: Option<i64>,
    partials: Vec<ResultMessage>,
) -> Result<Payload, AnalysisError> {
    let payload = match kind {
        AnalysisKind::WordCount => Payload::WordCount(
            partials
                .iter()
                .map(|p| match p.payload {
                    Payload::WordCount(c) => c,
                    _ => 0,
                })
                .fold(0, u64::saturating_add),
        ),

        AnalysisKind::TopNWords => {
            let limit = match n {
                None => TOP_N_CEILING,
                Some(n) if n > 0 => n as usize,
                Some(_) => 0,
            };
            let mut counts: HashMap<String, u64> = HashMap::new();
            for p in partials {
                if let Payload::TopWords(words) = p.payload {
                    for w in words {
                        let c = counts.entry(w.word).or_insert(0);
                        *c = c.saturating_add(w.count);
                    }
                }
            }
            Payload::TopWords(rank_words(counts, limit))
        }

        AnalysisKind::Tonality => {
            let mut total = ToneTally::default();
            for p in &partials {
                if let Payload::Tonality(t) = p.payload {
                    total.positive += t.positive;
                    total.negative += t.negative;
                }
            }
            Payload::Tonality(total)
        }

        AnalysisKind::SortSentences => {
            let mut all: Vec<Sentence> = Vec::new();
            for p in partials {
                if let Payload::Sentences(mut s) = p.payload {
                    all.append(&mut s);
                }
            }
            // sort_by es estable: a igual largo se mantiene el orden de llegada
            all.sort_by(|a, b| b.length.cmp(&a.length));
            Payload::Sentences(all)
        }

        AnalysisKind::ReplaceText => {
            let mut partials = partials;
            if partials.iter().all(|p| p.batch_index.is_some()) {
                partials.sort_by_key(|p| p.batch_index);
            }
            Payload::Text(
                partials
                    .into_iter()
                    .filter_map(|p| match p.payload {
                        Payload::Text(t) => Some(t),
                        _ => None,
                    })
                    .collect(),
            )
        }

        AnalysisKind::Unknown => return Err(AnalysisError::UnknownKind),
    };

    Ok(payload)
}
