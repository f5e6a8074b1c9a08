//! Tool factory: name → factory registry handing capabilities to modules.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::ConfigError;

/// Identifier handed to a factory on every request. Shared by all tool kinds.
pub type RequestId = u64;

/// The factory closure stored for a tool name.
pub type ToolFactoryFn = dyn Fn(RequestId) -> anyhow::Result<Option<Tool>> + Send + Sync;

/// A type-erased capability handed to a module creator.
#[derive(Clone)]
pub struct Tool(Arc<dyn Any + Send + Sync>);

impl Tool {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Returns the tool as `T`, or `None` if it is a different type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tool(..)")
    }
}

/// The tools resolved for one creator call, in declared order.
///
/// Unavailable tools keep their position as `None`.
#[derive(Clone, Debug, Default)]
pub struct Tools {
    entries: Vec<(String, Option<Tool>)>,
}

impl Tools {
    pub fn new(entries: Vec<(String, Option<Tool>)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The tool at `index`, downcast to `T`.
    pub fn get<T: Any + Send + Sync>(&self, index: usize) -> Option<Arc<T>> {
        self.entries
            .get(index)
            .and_then(|(_, tool)| tool.as_ref())
            .and_then(Tool::downcast::<T>)
    }

    /// The first tool declared under `name`, downcast to `T`.
    pub fn by_name<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, tool)| tool.as_ref())
            .and_then(Tool::downcast::<T>)
    }

    pub fn is_missing(&self, index: usize) -> bool {
        !matches!(self.entries.get(index), Some((_, Some(_))))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Tool>)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t.as_ref()))
    }
}

/// Registry of tool factories. Registrations are permanent.
pub struct ToolFactory {
    factories: DashMap<String, Arc<ToolFactoryFn>>,
    next_id: AtomicU64,
}

impl fmt::Debug for ToolFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("ToolFactory")
            .field("tools", &names)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ToolFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolFactory {
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a factory under `name`. Fails if the name is taken.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<(), ConfigError>
    where
        F: Fn(RequestId) -> anyhow::Result<Option<Tool>> + Send + Sync + 'static,
    {
        let name = name.into();
        match self.factories.entry(name) {
            Entry::Occupied(e) => {
                tracing::warn!(tool = %e.key(), "Tool already registered");
                Err(ConfigError::DuplicateTool(e.key().clone()))
            }
            Entry::Vacant(e) => {
                tracing::debug!(tool = %e.key(), "Tool registered");
                e.insert(Arc::new(factory));
                Ok(())
            }
        }
    }

    /// Invokes the factory for `name` with a fresh request id.
    ///
    /// Returns `None` when the tool is not registered or the factory yields nothing.
    pub fn request(&self, name: &str) -> Option<Tool> {
        // Clone the factory out so it never runs while the map shard is locked.
        let factory = self.factories.get(name).map(|f| Arc::clone(f.value()))?;
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);

        match factory(id) {
            Ok(tool) => tool,
            Err(e) => {
                tracing::debug!(tool = name, request_id = id, error = %e, "Tool factory failed");
                None
            }
        }
    }

    /// Resolves every name in order; unavailable tools become `None`.
    pub fn resolve(&self, names: &[String]) -> Tools {
        Tools::new(
            names
                .iter()
                .map(|n| (n.clone(), self.request(n)))
                .collect(),
        )
    }
}
