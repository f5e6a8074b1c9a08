//! The realized module object.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::method::Method;
use crate::object::ModuleObject;
use crate::reporter::ErrorReporter;
use crate::tools::{Tool, Tools};

/// A module instance: data fields, a fixed method table and the current super slot.
///
/// Field locks are only held for the duration of a read or write, never across a
/// method call, so methods may freely call each other and the runtime.
pub struct Instance {
    module: String,
    fields: Mutex<Map<String, Value>>,
    methods: BTreeMap<String, Method>,
    current_super: Mutex<Option<Method>>,
    tools: BTreeMap<String, Option<Tool>>,
    reporter: ErrorReporter,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("module", &self.module)
            .field("fields", &*self.fields.lock())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Instance {
    /// Builds an instance from a composed object.
    ///
    /// With `decorate`, every method is wrapped so its failures are logged and swallowed.
    /// `tools` are recorded on the instance (debug mode only).
    pub(crate) fn build(
        module: &str,
        object: ModuleObject,
        reporter: ErrorReporter,
        decorate: bool,
        tools: Option<&[Tools]>,
    ) -> Arc<Self> {
        let (fields, mut methods) = object.into_parts();

        if decorate {
            methods = methods
                .into_iter()
                .map(|(name, m)| {
                    let prefix =
                        format!("Error in module \"{module}\" executing method \"{name}\": ");
                    (name, m.decorate(prefix))
                })
                .collect();
        }

        let mut recorded = BTreeMap::new();
        for level in tools.unwrap_or_default() {
            for (name, tool) in level.iter() {
                recorded
                    .entry(name.to_string())
                    .or_insert_with(|| tool.cloned());
            }
        }

        Arc::new(Self {
            module: module.to_string(),
            fields: Mutex::new(fields),
            methods,
            current_super: Mutex::new(None),
            tools: recorded,
            reporter,
        })
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields.lock().get(name).cloned()
    }

    /// Reads a field and deserializes it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.lock().insert(name.into(), value.into())
    }

    /// Mutates a field in place, inserting `Value::Null` first if it is missing.
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut Value) -> R) -> R {
        let mut fields = self.fields.lock();
        let slot = fields.entry(name.to_string()).or_insert(Value::Null);
        f(slot)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Calls a method by name.
    pub fn call(self: &Arc<Self>, name: &str, args: &[Value]) -> anyhow::Result<Value> {
        let method = self.methods.get(name).ok_or_else(|| CoreError::MissingMethod {
            module: self.module.clone(),
            method: name.to_string(),
        })?;
        method.invoke(self, args)
    }

    /// Calls the parent version of the method currently executing.
    pub fn call_super(self: &Arc<Self>, args: &[Value]) -> anyhow::Result<Value> {
        let parent = self.current_super.lock().clone();
        match parent {
            Some(parent) => parent.invoke(self, args),
            None => anyhow::bail!(
                "module \"{}\": no parent method to call from here",
                self.module
            ),
        }
    }

    /// Swaps the current super slot, returning the previous value.
    pub(crate) fn bind_super(&self, parent: Option<Method>) -> Option<Method> {
        std::mem::replace(&mut *self.current_super.lock(), parent)
    }

    /// A tool injected at instantiation. Only recorded in debug mode.
    pub fn tool<T: std::any::Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.tools
            .get(name)
            .and_then(Option::as_ref)
            .and_then(Tool::downcast::<T>)
    }

    pub fn recorded_tools(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}
