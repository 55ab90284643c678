use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::JobError;
use super::handler::JobHandler;

/// Queue name -> handler mapping, built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), JobError> {
        let queue = queue.into();
        if self.handlers.contains_key(&queue) {
            return Err(JobError::DuplicateHandler(queue));
        }
        self.handlers.insert(queue, handler);
        Ok(())
    }

    pub fn get(&self, queue: &str) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(queue)
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn JobHandler>)> {
        self.handlers.iter().map(|(q, h)| (q.as_str(), h))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
