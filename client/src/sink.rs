use anyhow::{Context, Result};
use chrono::{Local, Utc};
use common::{MessageBus, Payload, ResultMessage, SINK_QUEUE};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};

const RULE: &str = "========================================";
const THIN_RULE: &str = "----------------------------------------";

/// Texto legible de un resultado agregado, tal como se guarda en disco.
pub fn render(result: &ResultMessage) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "RESULTADO AGREGADO DE LA TAREA {}", result.task_id);
    let _ = writeln!(out, "Tipo: {}", result.kind);
    let _ = writeln!(
        out,
        "Secciones procesadas: {} / {}",
        result.sections_count, result.total_sections
    );
    if let Some(n) = result.params.n {
        let _ = writeln!(out, "N: {n}");
    }
    if let Some(r) = &result.params.replace {
        let _ = writeln!(out, "Reemplazo: '{}' -> '{}'", r.from, r.to);
    }
    let _ = writeln!(out, "{THIN_RULE}");

    match &result.payload {
        Payload::WordCount(n) => {
            let _ = writeln!(out, "Cantidad de palabras: {n}");
        }
        Payload::TopWords(words) => {
            let _ = writeln!(out, "Top {} palabras:", words.len());
            for w in words {
                let _ = writeln!(out, "{}: {}", w.word, w.count);
            }
        }
        Payload::Tonality(t) => {
            let _ = writeln!(
                out,
                "Tonalidad: {} (positivas: {}, negativas: {})",
                t.verdict(),
                t.positive,
                t.negative
            );
        }
        Payload::Sentences(sentences) => {
            let _ = writeln!(out, "Oraciones ordenadas:");
            for s in sentences {
                let _ = writeln!(out, "{} ({})", s.text, s.length);
            }
        }
        Payload::Text(text) => {
            let _ = writeln!(out, "Texto con reemplazos:");
            let _ = writeln!(out, "{text}");
        }
        Payload::Empty => {
            let _ = writeln!(out, "(sin resultado)");
        }
    }

    let _ = writeln!(out, "{RULE}");
    out
}

/// Escribe `task_<id>.txt` en `dir` y devuelve la ruta.
pub fn write_result(dir: &Path, result: &ResultMessage) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creando {}", dir.display()))?;
    let path = dir.join(format!("task_{}.txt", result.task_id));
    fs::write(&path, render(result)).with_context(|| format!("escribiendo {}", path.display()))?;
    Ok(path)
}

/// Consume la cola del sink hasta que `shutdown` pase a `true`. Devuelve
/// cuántos resultados se guardaron.
pub async fn run_sink(
    bus: &dyn MessageBus,
    dir: &Path,
    poll_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<usize> {
    let mut written = 0;

    while !*shutdown.borrow() {
        let delivery = tokio::select! {
            got = bus.receive(SINK_QUEUE, poll_timeout) => got?,
            _ = shutdown.changed() => break,
        };
        let Some(delivery) = delivery else {
            continue;
        };

        match ResultMessage::from_json(&delivery.body) {
            Ok(result) => {
                let now = Utc::now().timestamp_millis();
                println!(
                    "[TASK END] Task {} completada a las {} ({} ms)",
                    result.task_id,
                    Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    now - result.start_time
                );

                // si no se puede escribir, se deja para que otro sink lo tome
                if let Err(e) = write_result(dir, &result) {
                    warn!("task {}: {:#}", result.task_id, e);
                    bus.nack(SINK_QUEUE, delivery.tag, true).await?;
                    continue;
                }
                written += 1;
            }
            Err(e) => error!("resultado agregado inválido: {}", e),
        }

        bus.ack(SINK_QUEUE, delivery.tag).await?;
    }

    Ok(written)
}
