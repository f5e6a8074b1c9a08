//! Topic index and deferred delivery.
//!
//! The index maps `topic -> (subscriber id -> handler)` plus the reverse
//! `subscriber id -> [topic]`. Both live behind one lock, which is never held while a
//! handler runs.
//!
//! `publish` snapshots the current subscribers of a topic and schedules one task.
//! When the task runs, each snapshot entry is checked against the live index first:
//! unsubscribing before dispatch cancels delivery to that subscriber.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use corekit::{catch_panic, ErrorReporter, RequestId, Scheduler};

use crate::envelope::{payload, Envelope, Payload};

pub type Handler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

/// One topic or a list of topics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topics(Vec<String>);

impl Topics {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<&str> for Topics {
    fn from(topic: &str) -> Self {
        Self(vec![topic.to_string()])
    }
}

impl From<String> for Topics {
    fn from(topic: String) -> Self {
        Self(vec![topic])
    }
}

impl From<&[&str]> for Topics {
    fn from(topics: &[&str]) -> Self {
        Self(topics.iter().map(|t| t.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Topics {
    fn from(topics: [&str; N]) -> Self {
        Self(topics.iter().map(|t| t.to_string()).collect())
    }
}

impl From<Vec<String>> for Topics {
    fn from(topics: Vec<String>) -> Self {
        Self(topics)
    }
}

#[derive(Default)]
struct Index {
    topics: HashMap<String, BTreeMap<RequestId, Handler>>,
    subscribers: HashMap<RequestId, Vec<String>>,
}

impl Index {
    /// Whether `handler` is still the live subscription of `id` on `topic`.
    ///
    /// A subscription replaced after an unsubscribe does not count.
    fn is_current(&self, topic: &str, id: RequestId, handler: &Handler) -> bool {
        self.topics
            .get(topic)
            .and_then(|subs| subs.get(&id))
            .is_some_and(|live| Arc::ptr_eq(live, handler))
    }
}

/// The shared message bus behind every [`MediatorHandle`].
pub struct MessageBus {
    index: Mutex<Index>,
    scheduler: Arc<dyn Scheduler>,
    reporter: ErrorReporter,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.index.lock();
        f.debug_struct("MessageBus")
            .field("topics", &index.topics.len())
            .field("subscribers", &index.subscribers.len())
            .finish()
    }
}

impl MessageBus {
    pub fn new(scheduler: Arc<dyn Scheduler>, reporter: ErrorReporter) -> Arc<Self> {
        Arc::new(Self {
            index: Mutex::new(Index::default()),
            scheduler,
            reporter,
        })
    }

    /// A handle acting as subscriber `id`.
    pub fn handle(self: &Arc<Self>, id: RequestId) -> MediatorHandle {
        MediatorHandle {
            id,
            bus: Arc::clone(self),
        }
    }

    /// Number of subscribers currently registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.index.lock().topics.get(topic).map_or(0, BTreeMap::len)
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.index.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    fn subscribe(&self, id: RequestId, topics: Topics, handler: Handler) {
        let debug = self.reporter.is_debug();
        let mut index = self.index.lock();

        for topic in topics.iter() {
            let subs = index.topics.entry(topic.to_string()).or_default();
            if subs.contains_key(&id) {
                continue;
            }
            let stored = if debug {
                handler.clone()
            } else {
                self.decorate(topic, handler.clone())
            };
            subs.insert(id, stored);
            index
                .subscribers
                .entry(id)
                .or_default()
                .push(topic.to_string());
            tracing::debug!(subscriber = id, topic, "Subscribed");
        }
    }

    fn decorate(&self, topic: &str, handler: Handler) -> Handler {
        let reporter = self.reporter.clone();
        let prefix = format!("Error publishing topic \"{topic}\": ");
        Arc::new(move |envelope: &Envelope| {
            if let Err(e) = catch_panic(|| handler(envelope)) {
                reporter.log(format!("{prefix}{e}"));
            }
            Ok(())
        })
    }

    fn unsubscribe(&self, id: RequestId, topics: &Topics) {
        let mut index = self.index.lock();
        for topic in topics.iter() {
            let Some(subs) = index.topics.get_mut(topic) else {
                continue;
            };
            if subs.remove(&id).is_none() {
                continue;
            }
            if subs.is_empty() {
                index.topics.remove(topic);
            }
            if let Some(own) = index.subscribers.get_mut(&id) {
                own.retain(|t| t != topic);
                if own.is_empty() {
                    index.subscribers.remove(&id);
                }
            }
            tracing::debug!(subscriber = id, topic, "Unsubscribed");
        }
    }

    fn subscribed_topics(&self, id: RequestId) -> Vec<String> {
        self.index
            .lock()
            .subscribers
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    fn publish(self: &Arc<Self>, topic: &str, data: Payload, skip_copy: bool) {
        let recipients: Vec<(RequestId, Handler)> = {
            let index = self.index.lock();
            match index.topics.get(topic) {
                Some(subs) => subs.iter().map(|(id, h)| (*id, h.clone())).collect(),
                None => Vec::new(),
            }
        };
        if recipients.is_empty() {
            tracing::trace!(topic, "Published with no subscribers");
            return;
        }

        let data = if skip_copy {
            Delivery::Shared(data)
        } else {
            Delivery::Copied(data.lock().clone())
        };

        tracing::trace!(topic, recipients = recipients.len(), skip_copy, "Published");
        let bus = Arc::clone(self);
        let topic = topic.to_string();
        self.scheduler
            .schedule(Box::new(move || bus.deliver(&topic, recipients, data)));
    }

    fn deliver(
        &self,
        topic: &str,
        recipients: Vec<(RequestId, Handler)>,
        data: Delivery,
    ) -> anyhow::Result<()> {
        let mut first_err = None;

        for (id, handler) in recipients {
            if !self.index.lock().is_current(topic, id, &handler) {
                tracing::debug!(subscriber = id, topic, "Delivery cancelled");
                continue;
            }
            let envelope = Envelope::new(topic, data.for_recipient());
            if let Err(e) = catch_panic(|| handler(&envelope)) {
                // Only raw (debug mode) handlers get here.
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e.context(format!("Error publishing topic \"{topic}\""))),
            None => Ok(()),
        }
    }
}

enum Delivery {
    Shared(Payload),
    Copied(Value),
}

impl Delivery {
    /// Copied payloads are cloned again per recipient, so one handler's mutations
    /// never reach another handler.
    fn for_recipient(&self) -> Payload {
        match self {
            Delivery::Shared(p) => Arc::clone(p),
            Delivery::Copied(v) => payload(v.clone()),
        }
    }
}

/// A bus handle bound to one subscriber id. This is the `"mediator"` tool.
#[derive(Clone)]
pub struct MediatorHandle {
    id: RequestId,
    bus: Arc<MessageBus>,
}

impl fmt::Debug for MediatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediatorHandle").field("id", &self.id).finish()
    }
}

impl MediatorHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Subscribes `handler` to each topic not already subscribed by this handle.
    pub fn subscribe<F>(&self, topics: impl Into<Topics>, handler: F)
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(self.id, topics.into(), Arc::new(handler));
    }

    /// Subscribes a handler bound to `context`.
    ///
    /// The context is held weakly; once it is dropped the handler is skipped.
    pub fn subscribe_with_context<C, F>(
        &self,
        topics: impl Into<Topics>,
        context: &Arc<C>,
        handler: F,
    )
    where
        C: Send + Sync + 'static,
        F: Fn(&Arc<C>, &Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let context: Weak<C> = Arc::downgrade(context);
        self.subscribe(topics, move |envelope| match context.upgrade() {
            Some(ctx) => handler(&ctx, envelope),
            None => {
                tracing::debug!(topic = %envelope.topic, "Handler context dropped, skipping");
                Ok(())
            }
        });
    }

    /// Publishes a copy of `data`, or `data` itself with `skip_copy`.
    pub fn publish(&self, topic: &str, data: Value, skip_copy: bool) {
        self.bus.publish(topic, payload(data), skip_copy);
    }

    /// Publishes a payload the caller keeps a handle on.
    ///
    /// With `skip_copy`, handlers and the caller observe each other's mutations.
    pub fn publish_payload(&self, topic: &str, data: &Payload, skip_copy: bool) {
        self.bus.publish(topic, Arc::clone(data), skip_copy);
    }

    pub fn unsubscribe(&self, topics: impl Into<Topics>) {
        self.bus.unsubscribe(self.id, &topics.into());
    }

    pub fn unsubscribe_all(&self) {
        let topics = Topics::from(self.bus.subscribed_topics(self.id));
        self.bus.unsubscribe(self.id, &topics);
    }

    /// Topics this handle is subscribed to, in subscription order.
    pub fn topics(&self) -> Vec<String> {
        self.bus.subscribed_topics(self.id)
    }
}
