//! Marker pattern cache with load deduplication.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use marker_protocol::MarkerId;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::SharedEngine;
use crate::error::LoadError;

type PatternLoad = Shared<BoxFuture<'static, Result<MarkerId, LoadError>>>;

enum PatternEntry {
    Loaded(MarkerId),
    Loading(PatternLoad),
}

/// Maps pattern keys (URLs or paths) to engine marker ids.
///
/// Each distinct key reaches the engine at most once at a time; callers that
/// ask while a load is running wait on the same load.
#[derive(Clone)]
pub struct PatternRegistry {
    engine: SharedEngine,
    entries: Arc<Mutex<HashMap<String, PatternEntry>>>,
}

impl PatternRegistry {
    pub fn new(engine: SharedEngine) -> Self {
        Self {
            engine,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve `pattern_key` to a marker id, loading it if needed.
    pub async fn load_once(&self, pattern_key: &str, size: f64) -> Result<MarkerId, LoadError> {
        if pattern_key.is_empty() {
            return Err(LoadError::MissingParameter("patternKey"));
        }

        let load = {
            let mut entries = self.entries.lock();
            match entries.get(pattern_key) {
                Some(PatternEntry::Loaded(id)) => return Ok(*id),
                Some(PatternEntry::Loading(load)) => {
                    debug!(pattern_key, "Joining in-flight pattern load");
                    load.clone()
                }
                None => {
                    let load = self.load(pattern_key.to_owned(), size).boxed().shared();
                    entries.insert(pattern_key.to_owned(), PatternEntry::Loading(load.clone()));
                    load
                }
            }
        };
        load.await
    }

    fn load(
        &self,
        pattern_key: String,
        size: f64,
    ) -> impl Future<Output = Result<MarkerId, LoadError>> + Send + 'static {
        let engine = Arc::clone(&self.engine);
        let entries = Arc::clone(&self.entries);

        async move {
            let result = engine
                .lock()
                .await
                .load_pattern(&pattern_key, size)
                .await
                .map_err(LoadError::from);

            let mut entries = entries.lock();
            match &result {
                Ok(id) => {
                    debug!(pattern_key = %pattern_key, marker_id = %id, "Pattern loaded");
                    entries.insert(pattern_key, PatternEntry::Loaded(*id));
                }
                Err(e) => {
                    warn!(pattern_key = %pattern_key, "Pattern load failed: {}", e);
                    entries.remove(&pattern_key);
                }
            }
            result
        }
    }

    /// Marker id for an already loaded pattern.
    pub fn cached(&self, pattern_key: &str) -> Option<MarkerId> {
        match self.entries.lock().get(pattern_key) {
            Some(PatternEntry::Loaded(id)) => Some(*id),
            _ => None,
        }
    }

    /// Number of patterns loaded or loading.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
