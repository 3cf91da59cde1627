use std::collections::HashMap;
use std::sync::Arc;

use crosswatch_backends::BackendAdapter;
use crosswatch_sync::Mapper;
use tokio::sync::Mutex;

/// Shared application state passed to all handlers.
///
/// The mapper is behind one mutex: webhook deliveries and the periodic
/// pull task both merge through it, and the merge must see its own prior
/// writes.
#[derive(Clone)]
pub struct AppState {
    pub adapters: Arc<HashMap<String, Arc<dyn BackendAdapter>>>,
    pub mapper: Arc<Mutex<Mapper>>,
}
