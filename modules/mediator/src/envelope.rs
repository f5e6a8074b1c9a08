use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// Published data as seen by handlers.
///
/// Without `skip_copy` every recipient gets its own payload; with `skip_copy` all
/// recipients (and the publisher, via [`crate::MediatorHandle::publish_payload`])
/// share one.
pub type Payload = Arc<Mutex<Value>>;

pub fn payload(data: Value) -> Payload {
    Arc::new(Mutex::new(data))
}

/// What a handler receives: the topic name and the data.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub topic: String,
    pub data: Payload,
}

impl Envelope {
    pub(crate) fn new(topic: &str, data: Payload) -> Self {
        Self {
            topic: topic.to_string(),
            data,
        }
    }

    /// Snapshot of the data.
    pub fn data(&self) -> Value {
        self.data.lock().clone()
    }

    /// Reads one top-level key of an object payload.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.data.lock())
    }
}
