use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::splitter::submit_task;
use common::store::read_text_files;
use common::{
    AnalysisKind, HttpBus, HttpStore, Params, Replacement, Settings, TextStore,
};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::sink;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para cargar textos, lanzar análisis y recoger resultados")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lista los textos cargados en el master
    List,

    /// Sube todos los *.txt de un directorio
    Load {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// Lanza un análisis sobre un texto cargado
    Submit {
        #[arg(value_name = "TEXTO")]
        text: String,

        /// words_count | top_n | tonality | sort_sentences | replace_text
        #[arg(long)]
        kind: AnalysisKind,

        /// N para top_n
        #[arg(long)]
        n: Option<i64>,

        /// Texto a buscar (replace_text)
        #[arg(long)]
        from: Option<String>,

        /// Texto de reemplazo (replace_text)
        #[arg(long, default_value = "")]
        to: String,

        /// Secciones por lote (default: BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Recoge resultados agregados y los guarda en archivos
    Sink {
        #[arg(long, default_value = "results")]
        dir: PathBuf,
    },
}

/// Arma los parámetros de la tarea y valida que el tipo los tenga.
fn build_params(
    kind: AnalysisKind,
    n: Option<i64>,
    from: Option<String>,
    to: String,
) -> Result<Params> {
    match kind {
        AnalysisKind::TopNWords if n.is_none() => bail!("top_n necesita --n"),
        AnalysisKind::ReplaceText if from.as_deref().map_or(true, str::is_empty) => {
            bail!("replace_text necesita --from")
        }
        AnalysisKind::Unknown => bail!(
            "tipo desconocido; opciones: {}",
            AnalysisKind::ALL
                .iter()
                .map(|k| k.as_wire())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        _ => {}
    }

    Ok(Params {
        n,
        replace: from.map(|from| Replacement { from, to }),
    })
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("client=info,common=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let store = HttpStore::new(settings.master_url.clone());

    match cli.command {
        Commands::List => {
            let mut texts = store.list_texts().await?;
            texts.sort_by(|a, b| a.name.cmp(&b.name));
            if texts.is_empty() {
                println!("No hay textos cargados.");
            } else {
                println!("Textos:");
                for t in texts {
                    println!(
                        "  {:<30} secciones={:<6} cargado={}",
                        t.name, t.sections, t.loaded_at
                    );
                }
            }
        }

        Commands::Load { dir } => {
            let files = read_text_files(&dir)?;
            if files.is_empty() {
                println!("No hay archivos .txt en {}", dir.display());
            }
            for (name, content) in files {
                match store.upload_text(&name, content).await {
                    Ok(t) => println!("  {} cargado ({} secciones)", t.name, t.sections),
                    Err(e) => println!("  {} no se pudo cargar: {:#}", name, e),
                }
            }
        }

        Commands::Submit {
            text,
            kind,
            n,
            from,
            to,
            batch_size,
        } => {
            let params = build_params(kind, n, from, to)?;
            let bus = HttpBus::new(settings.master_url.clone());
            let batch_size = batch_size.unwrap_or(settings.batch_size);

            let sub = submit_task(&bus, &store, &text, kind, params, batch_size).await?;

            println!("Tarea creada:");
            println!("  task_id: {}", sub.task_id);
            println!("  texto: {}", sub.text);
            println!("  tipo: {}", sub.kind);
            println!("  secciones: {}", sub.total_sections);
            println!("  lotes: {}", sub.batches);
        }

        Commands::Sink { dir } => {
            let bus = HttpBus::new(settings.master_url.clone());
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = tx.send(true);
            });

            info!("sink escribiendo en {}", dir.display());
            let written = sink::run_sink(&bus, &dir, settings.poll_timeout, rx).await?;
            println!("Sink detenido: {} resultados guardados.", written);
        }
    }

    Ok(())
}
