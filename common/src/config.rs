use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Cola donde el splitter publica los lotes.
pub const WORK_QUEUE: &str = "text-processing-tasks";
/// Cola donde los workers publican resultados parciales.
pub const RESULTS_QUEUE: &str = "text-processing-results";
/// Cola donde el aggregator publica los resultados finales.
pub const SINK_QUEUE: &str = "text-processing-aggregated";

/// Secciones por lote.
pub const DEFAULT_BATCH_SIZE: usize = 10;
/// Tamaño máximo (en bytes) de una sección al cargar un texto.
pub const SECTION_SIZE_BYTES: usize = 1024;
/// Tope de palabras para top_n cuando el resultado no trae `n`.
pub const TOP_N_CEILING: usize = 1000;

const DEFAULT_MASTER_URL: &str = "http://localhost:8080";
const DEFAULT_MASTER_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
const DEFAULT_TASK_TTL_SECS: u64 = 600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;
const DEFAULT_WORKER_CONCURRENCY: usize = 2;

/// Configuración de los procesos, leída de variables de entorno.
/// Cada binario usa sólo los campos que le interesan.
#[derive(Debug, Clone)]
pub struct Settings {
    /// URL base del master (bus + store), ej: http://master:8080
    pub master_url: String,
    /// Dirección donde escucha el master.
    pub master_addr: String,
    pub batch_size: usize,
    /// Espera máxima de un receive antes de volver a chequear el shutdown.
    pub poll_timeout: Duration,
    /// Edad máxima de una tarea incompleta en el aggregator.
    pub task_ttl: Duration,
    pub sweep_interval: Duration,
    /// Tiempo que un mensaje recibido queda invisible antes de reencolarse.
    pub visibility_timeout: Duration,
    pub max_delivery_attempts: u32,
    pub worker_concurrency: usize,
    /// Directorio con *.txt que el master carga al arrancar.
    pub texts_dir: Option<PathBuf>,
    /// Archivo donde el master persiste la secuencia de task ids.
    pub task_seq_path: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            master_url: env::var("MASTER_URL").unwrap_or_else(|_| DEFAULT_MASTER_URL.to_string()),
            master_addr: env::var("MASTER_ADDR")
                .unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string()),
            batch_size: env_or("BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            poll_timeout: Duration::from_millis(env_or("POLL_TIMEOUT_MS", DEFAULT_POLL_TIMEOUT_MS)),
            task_ttl: Duration::from_secs(env_or("TASK_TTL_SECS", DEFAULT_TASK_TTL_SECS)),
            sweep_interval: Duration::from_secs(env_or(
                "SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            )),
            visibility_timeout: Duration::from_secs(env_or(
                "VISIBILITY_TIMEOUT_SECS",
                DEFAULT_VISIBILITY_TIMEOUT_SECS,
            )),
            max_delivery_attempts: env_or("MAX_DELIVERY_ATTEMPTS", DEFAULT_MAX_DELIVERY_ATTEMPTS)
                .max(1),
            worker_concurrency: env_or("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY).max(1),
            texts_dir: env::var("TEXTS_DIR").ok().map(PathBuf::from),
            task_seq_path: env::var("TASK_SEQ_PATH").ok().map(PathBuf::from),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            master_url: DEFAULT_MASTER_URL.to_string(),
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            task_ttl: Duration::from_secs(DEFAULT_TASK_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            texts_dir: None,
            task_seq_path: None,
        }
    }
}

/// Lee una variable de entorno numérica; si no está o no parsea, usa el default.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_respeta_env_var_y_default() {
        env::set_var("COMMON_TEST_ENV_OR", "42");
        assert_eq!(env_or::<u64>("COMMON_TEST_ENV_OR", 7), 42);

        env::set_var("COMMON_TEST_ENV_OR_BAD", "no-es-numero");
        assert_eq!(env_or::<u64>("COMMON_TEST_ENV_OR_BAD", 7), 7);

        assert_eq!(env_or::<u64>("COMMON_TEST_ENV_OR_MISSING", 7), 7);
    }

    #[test]
    fn settings_default_usa_lotes_de_diez() {
        let s = Settings::default();
        assert_eq!(s.batch_size, 10);
        assert_eq!(s.max_delivery_attempts, 3);
        assert!(s.texts_dir.is_none());
    }
}
