use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::bus::{
    AckRequest, NackRequest, PublishRequest, QueueStats, ReceiveRequest, ReceiveResponse,
};
use common::store::{
    FetchSectionsRequest, FetchSectionsResponse, SectionIdsResponse, TaskIdResponse,
    UploadTextRequest,
};
use common::{MessageBus, StoreError, TextInfo, TextStore};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;

/// Espera máxima de un long-poll, aunque el worker pida más.
pub const MAX_RECEIVE_WAIT: Duration = Duration::from_secs(5);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/queues/:queue/publish", post(publish))
        .route("/api/v1/queues/:queue/receive", post(receive))
        .route("/api/v1/queues/:queue/ack", post(ack))
        .route("/api/v1/queues/:queue/nack", post(nack))
        .route("/api/v1/queues/:queue/stats", get(queue_stats))
        .route("/api/v1/texts", get(list_texts).post(upload_text))
        .route("/api/v1/texts/:name/sections", get(section_ids))
        .route("/api/v1/sections/fetch", post(fetch_sections))
        .route("/api/v1/task-ids", post(next_task_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Traduce errores del store a status HTTP.
fn store_status(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::TextNotFound(_)) | Some(StoreError::MissingSection(_)) => {
            StatusCode::NOT_FOUND
        }
        Some(StoreError::TextExists(_)) => StatusCode::CONFLICT,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

/* ---------------- colas ---------------- */

async fn publish(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<PublishRequest>,
) -> StatusCode {
    match state.bus.publish(&queue, req.body).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!("error publicando en {}: {:#}", queue, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn receive(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<ReceiveRequest>,
) -> Result<Json<ReceiveResponse>, StatusCode> {
    let wait = Duration::from_millis(req.timeout_ms).min(MAX_RECEIVE_WAIT);

    match state.bus.receive(&queue, wait).await {
        Ok(delivery) => Ok(Json(ReceiveResponse { delivery })),
        Err(e) => {
            warn!("error recibiendo de {}: {:#}", queue, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn ack(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<AckRequest>,
) -> StatusCode {
    match state.bus.ack(&queue, req.tag).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            // lease vencido y mensaje ya reentregado, o tag inventado
            warn!("{:#}", e);
            StatusCode::NOT_FOUND
        }
    }
}

async fn nack(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<NackRequest>,
) -> StatusCode {
    match state.bus.nack(&queue, req.tag, req.requeue).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!("{:#}", e);
            StatusCode::NOT_FOUND
        }
    }
}

async fn queue_stats(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<QueueStats>, StatusCode> {
    state
        .bus
        .stats(&queue)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/* ---------------- text store ---------------- */

async fn list_texts(State(state): State<AppState>) -> Result<Json<Vec<TextInfo>>, StatusCode> {
    let mut texts = state
        .store
        .list_texts()
        .await
        .map_err(|e| store_status(&e))?;
    texts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(texts))
}

async fn upload_text(
    State(state): State<AppState>,
    Json(req): Json<UploadTextRequest>,
) -> Result<(StatusCode, Json<TextInfo>), StatusCode> {
    if req.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state
        .store
        .insert_text(&req.name, &req.content, state.section_size)
    {
        Ok(info) => {
            info!("texto '{}' cargado: {} secciones", info.name, info.sections);
            Ok((StatusCode::CREATED, Json(info)))
        }
        Err(e) => {
            warn!("no se pudo cargar '{}': {:#}", req.name, e);
            Err(store_status(&e))
        }
    }
}

async fn section_ids(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SectionIdsResponse>, StatusCode> {
    let section_ids = state
        .store
        .section_ids(&name)
        .await
        .map_err(|e| store_status(&e))?;
    Ok(Json(SectionIdsResponse {
        text: name,
        section_ids,
    }))
}

async fn fetch_sections(
    State(state): State<AppState>,
    Json(req): Json<FetchSectionsRequest>,
) -> Result<Json<FetchSectionsResponse>, StatusCode> {
    let contents = state
        .store
        .fetch_sections(&req.ids)
        .await
        .map_err(|e| store_status(&e))?;
    Ok(Json(FetchSectionsResponse { contents }))
}

async fn next_task_id(State(state): State<AppState>) -> Result<Json<TaskIdResponse>, StatusCode> {
    match state.store.next_task_id().await {
        Ok(task_id) => Ok(Json(TaskIdResponse { task_id })),
        Err(e) => {
            warn!("no se pudo emitir task id: {:#}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use common::bus::Delivery;
    use common::{MemoryBus, MemoryStore};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let state = AppState::new(
            MemoryBus::new(Duration::from_secs(30), 3),
            MemoryStore::default(),
            4,
        );
        (build_router(state.clone()), state)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let (app, _) = app();
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cola_publish_receive_ack_por_http() {
        let (app, _) = app();

        let (status, _) = call(&app, Method::POST, "/api/v1/queues/q/publish", json!({"body": "hola"})).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) =
            call(&app, Method::POST, "/api/v1/queues/q/receive", json!({"timeout_ms": 10})).await;
        assert_eq!(status, StatusCode::OK);
        let delivery: Delivery = serde_json::from_value(body["delivery"].clone()).unwrap();
        assert_eq!(delivery.body, "hola");

        let (_, stats) = call(&app, Method::GET, "/api/v1/queues/q/stats", Value::Null).await;
        assert_eq!(stats, json!({"ready": 0, "unacked": 1}));

        let (status, _) =
            call(&app, Method::POST, "/api/v1/queues/q/ack", json!({"tag": delivery.tag})).await;
        assert_eq!(status, StatusCode::OK);

        // segundo ack del mismo tag
        let (status, _) =
            call(&app, Method::POST, "/api/v1/queues/q/ack", json!({"tag": delivery.tag})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) =
            call(&app, Method::POST, "/api/v1/queues/q/receive", json!({"timeout_ms": 10})).await;
        assert_eq!(body["delivery"], Value::Null);
    }

    #[tokio::test]
    async fn nack_con_requeue_reentrega() {
        let (app, _) = app();
        call(&app, Method::POST, "/api/v1/queues/q/publish", json!({"body": "x"})).await;

        let (_, body) =
            call(&app, Method::POST, "/api/v1/queues/q/receive", json!({"timeout_ms": 10})).await;
        let tag = body["delivery"]["tag"].as_u64().unwrap();

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/queues/q/nack",
            json!({"tag": tag, "requeue": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) =
            call(&app, Method::POST, "/api/v1/queues/q/receive", json!({"timeout_ms": 10})).await;
        assert_eq!(body["delivery"]["attempt"], json!(2));
    }

    #[tokio::test]
    async fn textos_subir_listar_y_leer_secciones() {
        let (app, _) = app();

        let (status, info) = call(
            &app,
            Method::POST,
            "/api/v1/texts",
            json!({"name": "libro", "content": "abcdefghij"}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(info["sections"], json!(3));

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/texts",
            json!({"name": "libro", "content": "otra vez"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, list) = call(&app, Method::GET, "/api/v1/texts", Value::Null).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, body) =
            call(&app, Method::GET, "/api/v1/texts/libro/sections", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<u64> = serde_json::from_value(body["section_ids"].clone()).unwrap();
        assert_eq!(ids.len(), 3);

        // pedidas en desorden, vuelven ordenadas por id
        let reversed: Vec<u64> = ids.iter().rev().copied().collect();
        let (status, body) =
            call(&app, Method::POST, "/api/v1/sections/fetch", json!({"ids": reversed})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contents"], json!(["abcd", "efgh", "ij"]));
    }

    #[tokio::test]
    async fn texto_o_seccion_inexistente_es_404() {
        let (app, _) = app();

        let (status, _) =
            call(&app, Method::GET, "/api/v1/texts/nada/sections", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            call(&app, Method::POST, "/api/v1/sections/fetch", json!({"ids": [99]})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn task_ids_son_crecientes() {
        let (app, _) = app();
        let (_, a) = call(&app, Method::POST, "/api/v1/task-ids", Value::Null).await;
        let (_, b) = call(&app, Method::POST, "/api/v1/task-ids", Value::Null).await;
        assert_eq!(a["task_id"], json!(1));
        assert_eq!(b["task_id"], json!(2));
    }
}
