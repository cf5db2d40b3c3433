use thiserror::Error;

use crate::kind::AnalysisKind;
use crate::message::{SectionId, TaskId};

/// Errores del análisis y la agregación.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("no hay handler ni reducer para un tipo desconocido")]
    UnknownKind,

    #[error("task {task_id}: llegó un parcial de tipo {got}, se esperaba {expected}")]
    KindMismatch {
        task_id: TaskId,
        expected: AnalysisKind,
        got: AnalysisKind,
    },
}

/// Errores del text store en memoria.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("texto no encontrado: {0}")]
    TextNotFound(String),

    #[error("el texto ya existe: {0}")]
    TextExists(String),

    #[error("sección inexistente: {0}")]
    MissingSection(SectionId),
}

/// Mensaje que ni siquiera es un objeto JSON.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JSON inválido: {0}")]
    Json(#[from] serde_json::Error),

    #[error("se esperaba un objeto JSON")]
    NotAnObject,
}
