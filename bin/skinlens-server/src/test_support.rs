//! In-process server fixture: scripted engine, in-memory audit store and a
//! running event consumer.

use std::sync::Arc;
use std::time::Duration;

use skinlens_core::{
    CancellationToken, ClassDictionary, ConsumerStats, EngineError, InferenceEngine,
    InferenceService, ModelSession, ModelShape, events,
};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db::sqlite::SqliteAuditStore;
use crate::state::AppState;

pub const SHAPE: ModelShape = ModelShape::new(2, 2, 1, 4);
pub const CLASSES: [&str; 4] = ["acne", "eczema", "normal", "psoriasis"];
pub const PROBS: [f32; 4] = [0.1, 0.6, 0.25, 0.05];

/// Returns [`PROBS`] after `delay`; fails when the first input value is
/// negative.
struct ScriptedEngine {
    delay: Duration,
}

impl InferenceEngine for ScriptedEngine {
    fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError> {
        std::thread::sleep(self.delay);
        if input[0] < 0.0 {
            return Err(EngineError::Run("scripted failure".to_owned()));
        }
        output.copy_from_slice(&PROBS);
        Ok(())
    }
}

pub fn valid_input() -> Vec<f32> {
    vec![0.5; SHAPE.input_size()]
}

pub fn failing_input() -> Vec<f32> {
    vec![-1.0; SHAPE.input_size()]
}

pub fn f32le(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inference over [`SHAPE`] and [`CLASSES`] where every call takes `delay`.
pub fn inference(delay: Duration) -> Arc<InferenceService> {
    let session = ModelSession::with_engine(SHAPE, ScriptedEngine { delay }, None).unwrap();
    let dictionary =
        ClassDictionary::new(CLASSES.iter().map(|s| (*s).to_owned()).collect()).unwrap();
    Arc::new(InferenceService::new(session, dictionary).unwrap())
}

pub fn config() -> Config {
    let mut config = Config::from_env();
    config.model_shape = SHAPE;
    config.max_body_bytes = 1024 * 1024;
    config.cors_allowed_origins = None;
    config
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: SqliteAuditStore,
    token: CancellationToken,
    consumer: JoinHandle<ConsumerStats>,
}

impl Harness {
    pub async fn new() -> Self {
        let token = CancellationToken::new();
        let (publisher, consumer) = events::bounded(16, token.clone());
        let store = SqliteAuditStore::in_memory().await;
        let consumer = tokio::spawn(consumer.run(store.clone()));

        Self {
            state: Arc::new(AppState {
                config: Arc::new(config()),
                inference: inference(Duration::ZERO),
                events: publisher,
            }),
            store,
            token,
            consumer,
        }
    }

    /// Stop the consumer after it has persisted everything queued so far.
    pub async fn drain(self) -> SqliteAuditStore {
        self.token.cancel();
        self.consumer.await.unwrap();
        self.store
    }
}
