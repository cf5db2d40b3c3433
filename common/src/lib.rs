pub mod aggregate;
pub mod bus;
pub mod config;
pub mod error;
pub mod handlers;
pub mod kind;
pub mod message;
pub mod splitter;
pub mod store;
pub mod text;

pub use aggregate::{Aggregator, Progress};
pub use bus::{Delivery, DeliveryTag, HttpBus, MemoryBus, MessageBus};
pub use config::{Settings, RESULTS_QUEUE, SINK_QUEUE, WORK_QUEUE};
pub use error::{AnalysisError, DecodeError, StoreError};
pub use kind::AnalysisKind;
pub use message::{
    Params, Payload, Replacement, ResultMessage, SectionId, Sentence, TaskId, TaskMessage,
    ToneTally, Verdict, WordFreq,
};
pub use store::{HttpStore, MemoryStore, TaskSequence, TextInfo, TextStore};
