//! Bus de mensajes con colas con nombre.
//!
//! Entrega "al menos una vez": un mensaje recibido queda en vuelo con un lease
//! hasta que el consumidor hace `ack`. Si el lease vence (el consumidor murió)
//! o hace `nack` con requeue, el mensaje vuelve a la cola. Un mensaje que se
//! entregó `max_attempts` veces se descarta con un error en el log.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{error, info};

pub type DeliveryTag = u64;

/// Un mensaje entregado a un consumidor, pendiente de ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: String,
    /// 1 en la primera entrega, 2 en la primera reentrega, etc.
    pub attempt: u32,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publica sin esperar confirmación de consumo.
    async fn publish(&self, queue: &str, body: String) -> Result<()>;

    /// Espera hasta `timeout` por un mensaje. `None` es una espera vacía, no un error.
    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>>;

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()>;

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()>;
}

/* ---------------- bus en memoria ---------------- */

#[derive(Debug, Clone)]
struct Envelope {
    body: String,
    /// Entregas ya hechas.
    deliveries: u32,
}

#[derive(Debug)]
struct Unacked {
    envelope: Envelope,
    lease_until: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    unacked: HashMap<DeliveryTag, Unacked>,
}

#[derive(Debug, Default)]
struct Queues {
    queues: HashMap<String, QueueState>,
    next_tag: DeliveryTag,
}

/// Tamaño de una cola, para monitoreo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
}

/// Bus en proceso. Lo usa el master para servir las colas y los tests para
/// armar el pipeline sin red.
#[derive(Debug)]
pub struct MemoryBus {
    state: Mutex<Queues>,
    notify: Notify,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl MemoryBus {
    pub fn new(visibility_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(Queues::default()),
            notify: Notify::new(),
            visibility_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Queues>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("lock de colas envenenado"))
    }

    pub fn stats(&self, queue: &str) -> Result<QueueStats> {
        let state = self.lock()?;
        Ok(state
            .queues
            .get(queue)
            .map(|q| QueueStats {
                ready: q.ready.len(),
                unacked: q.unacked.len(),
            })
            .unwrap_or(QueueStats { ready: 0, unacked: 0 }))
    }

    /// Devuelve a su cola los mensajes con lease vencido.
    /// Retorna cuántos se reencolaron.
    pub fn requeue_expired(&self, now: Instant) -> Result<usize> {
        let mut requeued = 0;
        {
            let mut state = self.lock()?;
            for (name, queue) in state.queues.iter_mut() {
                let expired: Vec<DeliveryTag> = queue
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.lease_until <= now)
                    .map(|(tag, _)| *tag)
                    .collect();

                for tag in expired {
                    if let Some(u) = queue.unacked.remove(&tag) {
                        info!(queue = %name, tag, "lease vencido, reencolando mensaje");
                        if requeue_or_drop(self.max_attempts, name, &mut queue.ready, u.envelope) {
                            requeued += 1;
                        }
                    }
                }
            }
        }

        if requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }

    fn try_pop(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.lock()?;
        let Queues { queues, next_tag } = &mut *state;
        let q = queues.entry(queue.to_string()).or_default();

        let Some(mut envelope) = q.ready.pop_front() else {
            return Ok(None);
        };

        *next_tag += 1;
        let tag = *next_tag;
        envelope.deliveries += 1;

        let delivery = Delivery {
            tag,
            body: envelope.body.clone(),
            attempt: envelope.deliveries,
        };
        q.unacked.insert(
            tag,
            Unacked {
                envelope,
                lease_until: Instant::now() + self.visibility_timeout,
            },
        );

        Ok(Some(delivery))
    }
}

/// Reencola si todavía quedan intentos; si no, descarta. `true` si se reencoló.
fn requeue_or_drop(
    max_attempts: u32,
    queue: &str,
    ready: &mut VecDeque<Envelope>,
    envelope: Envelope,
) -> bool {
    if envelope.deliveries >= max_attempts {
        error!(
            queue,
            deliveries = envelope.deliveries,
            body = %envelope.body,
            "mensaje descartado tras agotar los intentos de entrega"
        );
        false
    } else {
        ready.push_back(envelope);
        true
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, queue: &str, body: String) -> Result<()> {
        {
            let mut state = self.lock()?;
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(Envelope {
                    body,
                    deliveries: 0,
                });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // registrarse antes de mirar la cola para no perder un notify
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_pop(queue)? {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()> {
        let mut state = self.lock()?;
        let removed = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&tag));
        if removed.is_none() {
            bail!("ack de un tag desconocido: {queue}/{tag}");
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let requeued = {
            let mut state = self.lock()?;
            let Some(q) = state.queues.get_mut(queue) else {
                bail!("nack en una cola desconocida: {queue}");
            };
            let Some(u) = q.unacked.remove(&tag) else {
                bail!("nack de un tag desconocido: {queue}/{tag}");
            };
            requeue && requeue_or_drop(self.max_attempts, queue, &mut q.ready, u.envelope)
        };

        if requeued {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

/* ---------------- cliente HTTP contra el master ---------------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveResponse {
    pub delivery: Option<Delivery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub tag: DeliveryTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackRequest {
    pub tag: DeliveryTag,
    pub requeue: bool,
}

/// Bus remoto: habla con las colas del master por HTTP.
#[derive(Debug, Clone)]
pub struct HttpBus {
    client: Client,
    base_url: String,
}

impl HttpBus {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Consulta `/health`; los procesos la usan al arrancar para fallar
    /// enseguida si el master no está.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("el master no responde en {url}"))?;
        if !resp.status().is_success() {
            bail!("master devolvió status {} en {}", resp.status(), url);
        }
        Ok(())
    }

    fn url(&self, queue: &str, op: &str) -> String {
        format!("{}/api/v1/queues/{}/{}", self.base_url, queue, op)
    }

    async fn post<T: Serialize + ?Sized>(&self, queue: &str, op: &str, body: &T) -> Result<reqwest::Response> {
        let url = self.url(queue, op);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        if !resp.status().is_success() {
            bail!("master devolvió status {} en {}", resp.status(), url);
        }
        Ok(resp)
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn publish(&self, queue: &str, body: String) -> Result<()> {
        self.post(queue, "publish", &PublishRequest { body }).await?;
        Ok(())
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let req = ReceiveRequest {
            timeout_ms: timeout.as_millis() as u64,
        };
        let resp: ReceiveResponse = self.post(queue, "receive", &req).await?.json().await?;
        Ok(resp.delivery)
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()> {
        self.post(queue, "ack", &AckRequest { tag }).await?;
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.post(queue, "nack", &NackRequest { tag, requeue }).await?;
        Ok(())
    }
}
