// master/src/state.rs

use common::{MemoryBus, MemoryStore};
use std::sync::Arc;

/// Estado compartido por los handlers HTTP y el monitor de leases.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<MemoryBus>,
    pub store: Arc<MemoryStore>,
    /// Tamaño de sección para textos subidos por HTTP.
    pub section_size: usize,
}

impl AppState {
    pub fn new(bus: MemoryBus, store: MemoryStore, section_size: usize) -> Self {
        Self {
            bus: Arc::new(bus),
            store: Arc::new(store),
            section_size,
        }
    }
}
