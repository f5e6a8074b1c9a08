//! Module registry: the lifecycle state machine.
//!
//! Per (module, instance name):
//! `Undefined → Defined → Instantiated → Started ⇄ Stopped → Destroyed`.
//!
//! The definition table lock is never held while user code runs (creators, hooks),
//! so hooks may call back into the registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::compose::SuperChain;
use crate::error::{ConfigError, CoreError};
use crate::instance::Instance;
use crate::instances::InstanceManager;
use crate::object::ModuleObject;
use crate::reporter::ErrorReporter;
use crate::tools::{ToolFactory, Tools};

/// A module creator: receives its declared tools in order, returns the module object.
pub type Creator = Arc<dyn Fn(&Tools) -> anyhow::Result<ModuleObject> + Send + Sync>;

pub(crate) struct ModuleDefinition {
    pub(crate) name: String,
    pub(crate) tool_names: Vec<String>,
    pub(crate) creator: Creator,
    pub(crate) super_name: Option<String>,
    instances: BTreeMap<String, Arc<InstanceRecord>>,
}

impl fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("name", &self.name)
            .field("tool_names", &self.tool_names)
            .field("super_name", &self.super_name)
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Bookkeeping for one realized instance.
#[derive(Debug)]
pub struct InstanceRecord {
    name: String,
    instance: Arc<Instance>,
    started: AtomicBool,
}

impl InstanceRecord {
    fn new(name: &str, instance: Arc<Instance>) -> Self {
        Self {
            name: name.to_string(),
            instance,
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Release);
    }
}

/// Summary of one definition, as returned by [`ModuleRegistry::get_modules`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub tool_names: Vec<String>,
    pub super_name: Option<String>,
    /// Instance name → started.
    pub instances: Vec<(String, bool)>,
}

struct RegistryInner {
    defs: Mutex<HashMap<String, ModuleDefinition>>,
    tools: Arc<ToolFactory>,
    reporter: ErrorReporter,
}

/// Cheap-to-clone handle on the module table.
#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.module_names())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new(tools: Arc<ToolFactory>, reporter: ErrorReporter) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                defs: Mutex::new(HashMap::new()),
                tools,
                reporter,
            }),
        }
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.inner.reporter
    }

    pub fn tools(&self) -> &Arc<ToolFactory> {
        &self.inner.tools
    }

    /// Defines a new module.
    pub fn define<F>(&self, name: &str, tool_names: &[&str], creator: F) -> Result<(), ConfigError>
    where
        F: Fn(&Tools) -> anyhow::Result<ModuleObject> + Send + Sync + 'static,
    {
        let mut defs = self.inner.defs.lock();
        if defs.contains_key(name) {
            tracing::warn!(module = name, "Module already defined");
            return Err(ConfigError::DuplicateModule(name.to_string()));
        }
        defs.insert(name.to_string(), Self::definition(name, tool_names, creator, None));
        tracing::debug!(module = name, tools = ?tool_names, "Module defined");
        Ok(())
    }

    /// Defines a module that extends `super_name`.
    pub fn inherit<F>(
        &self,
        super_name: &str,
        name: &str,
        tool_names: &[&str],
        creator: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&Tools) -> anyhow::Result<ModuleObject> + Send + Sync + 'static,
    {
        let mut defs = self.inner.defs.lock();
        if super_name == name {
            tracing::warn!(module = name, "Module cannot inherit from itself");
            return Err(ConfigError::SelfInheritance(name.to_string()));
        }
        if !defs.contains_key(super_name) {
            tracing::warn!(module = name, super_name, "Unknown super module");
            return Err(ConfigError::UnknownSuper {
                module: name.to_string(),
                super_name: super_name.to_string(),
            });
        }
        if defs.contains_key(name) {
            tracing::warn!(module = name, "Module already defined");
            return Err(ConfigError::DuplicateModule(name.to_string()));
        }
        defs.insert(
            name.to_string(),
            Self::definition(name, tool_names, creator, Some(super_name.to_string())),
        );
        tracing::debug!(
            module = name,
            super_name,
            tools = ?tool_names,
            "Module defined by inheritance"
        );
        Ok(())
    }

    fn definition<F>(
        name: &str,
        tool_names: &[&str],
        creator: F,
        super_name: Option<String>,
    ) -> ModuleDefinition
    where
        F: Fn(&Tools) -> anyhow::Result<ModuleObject> + Send + Sync + 'static,
    {
        ModuleDefinition {
            name: name.to_string(),
            tool_names: tool_names.iter().map(|t| t.to_string()).collect(),
            creator: Arc::new(creator),
            super_name,
            instances: BTreeMap::new(),
        }
    }

    /// Creates a fresh instance without recording it.
    ///
    /// Walks the super chain, runs each creator with its tools, merges the results and
    /// decorates the methods (unless in debug mode).
    pub fn instantiate(&self, name: &str) -> Result<Option<Arc<Instance>>, CoreError> {
        let chain = {
            let defs = self.inner.defs.lock();
            SuperChain::resolve(&defs, name)
        };
        let chain = match chain {
            Ok(Some(chain)) => chain,
            Ok(None) => {
                self.report(CoreError::not_found(name))?;
                return Ok(None);
            }
            Err(e) => {
                self.report(e)?;
                return Ok(None);
            }
        };

        let levels = chain.len();
        let composed = match chain.compose(&self.inner.tools) {
            Ok(composed) => composed,
            Err(e) => {
                self.report(e)?;
                return Ok(None);
            }
        };

        let debug_mode = self.inner.reporter.is_debug();
        let instance = Instance::build(
            name,
            composed.object,
            self.inner.reporter.clone(),
            !debug_mode,
            debug_mode.then_some(composed.tools.as_slice()),
        );
        tracing::debug!(module = name, levels, debug_mode, "Module instantiated");
        Ok(Some(instance))
    }

    /// Starts the default instance (named after the module), creating it on first use.
    ///
    /// Returns whether the instance ended up started.
    pub fn start(&self, name: &str, start_data: Value) -> Result<bool, CoreError> {
        self.start_record(name, name, vec![start_data])
    }

    pub(crate) fn start_record(
        &self,
        name: &str,
        instance_name: &str,
        args: Vec<Value>,
    ) -> Result<bool, CoreError> {
        let Some(record) = self.ensure_record(name, instance_name)? else {
            return Ok(false);
        };
        if record.is_started() {
            return Ok(true);
        }

        record
            .instance
            .call("onStart", &args)
            .map_err(|e| CoreError::from_hook(name, "onStart", e))?;
        record.set_started(true);
        tracing::debug!(module = name, instance = instance_name, "Module started");
        Ok(true)
    }

    /// Stops the default instance; with `and_destroy` the whole definition is removed.
    ///
    /// Returns whether the module ended stopped (and destroyed, if requested).
    pub fn stop(&self, name: &str, and_destroy: bool) -> Result<bool, CoreError> {
        let Some(record) = self.get_instance(name, None)? else {
            return Ok(false);
        };
        self.stop_record(name, &record, and_destroy)?;

        if and_destroy {
            self.remove_definition(name);
            return Ok(true);
        }
        Ok(!record.is_started())
    }

    /// Runs `onStop` (if started) and `onDestroy` (if requested) on one record.
    pub(crate) fn stop_record(
        &self,
        name: &str,
        record: &InstanceRecord,
        and_destroy: bool,
    ) -> Result<(), CoreError> {
        let instance = &record.instance;

        if record.is_started() {
            if instance.has_method("onStop") {
                instance
                    .call("onStop", &[])
                    .map_err(|e| CoreError::from_hook(name, "onStop", e))?;
            }
            record.set_started(false);
            tracing::debug!(module = name, instance = record.name(), "Module stopped");
        }

        if and_destroy && instance.has_method("onDestroy") {
            instance
                .call("onDestroy", &[])
                .map_err(|e| CoreError::from_hook(name, "onDestroy", e))?;
        }
        Ok(())
    }

    /// Whether the default instance of `name` exists and is started.
    pub fn is_started(&self, name: &str) -> bool {
        self.inner
            .defs
            .lock()
            .get(name)
            .and_then(|def| def.instances.get(name))
            .is_some_and(|record| record.is_started())
    }

    /// Starts `names`, or every defined module when `None`.
    ///
    /// `start_data` is an object keyed by module name; a missing key starts with `Null`.
    /// Returns whether every module ended up started.
    pub fn start_all(&self, names: Option<&[&str]>, start_data: &Value) -> Result<bool, CoreError> {
        let mut all = true;
        for name in self.selection(names) {
            let data = start_data.get(&name).cloned().unwrap_or(Value::Null);
            all &= self.start(&name, data)?;
        }
        Ok(all)
    }

    /// Stops the default instance of `names`, or of every defined module when `None`.
    pub fn stop_all(&self, names: Option<&[&str]>) -> Result<bool, CoreError> {
        let mut all = true;
        for name in self.selection(names) {
            all &= self.stop(&name, false)?;
        }
        Ok(all)
    }

    /// Stops every instance of `name`, runs their `onDestroy` and removes the definition.
    ///
    /// Unlike [`ModuleRegistry::stop`] with `and_destroy`, the definition goes away even
    /// if it was never instantiated.
    pub fn destroy(&self, name: &str) -> Result<bool, CoreError> {
        let records: Option<Vec<Arc<InstanceRecord>>> = self
            .inner
            .defs
            .lock()
            .get(name)
            .map(|def| def.instances.values().cloned().collect());
        let Some(records) = records else {
            self.report(CoreError::not_found(name))?;
            return Ok(false);
        };

        for record in &records {
            self.stop_record(name, record, true)?;
        }
        self.remove_definition(name);
        Ok(true)
    }

    /// Destroys `names`, or every defined module when `None`.
    ///
    /// Modules already removed by an earlier module's hooks are skipped.
    pub fn destroy_all(&self, names: Option<&[&str]>) -> Result<bool, CoreError> {
        let all_modules = names.is_none();
        let mut all = true;
        for name in self.selection(names) {
            if all_modules && !self.is_defined(&name) {
                continue;
            }
            all &= self.destroy(&name)?;
        }
        Ok(all)
    }

    fn selection(&self, names: Option<&[&str]>) -> Vec<String> {
        match names {
            Some(names) => names.iter().map(|n| n.to_string()).collect(),
            None => self.module_names(),
        }
    }

    /// Returns the record for an instance; `None` instance name means the default one.
    pub fn get_instance(
        &self,
        name: &str,
        instance_name: Option<&str>,
    ) -> Result<Option<Arc<InstanceRecord>>, CoreError> {
        let lookup = {
            let defs = self.inner.defs.lock();
            defs.get(name).map(|def| {
                def.instances
                    .get(instance_name.unwrap_or(name))
                    .cloned()
            })
        };
        match lookup {
            Some(record) => Ok(record),
            None => {
                self.report(CoreError::not_found(name))?;
                Ok(None)
            }
        }
    }

    /// Summaries of every definition, sorted by name.
    pub fn get_modules(&self) -> Vec<ModuleInfo> {
        let defs = self.inner.defs.lock();
        let mut modules: Vec<ModuleInfo> = defs
            .values()
            .map(|def| ModuleInfo {
                name: def.name.clone(),
                tool_names: def.tool_names.clone(),
                super_name: def.super_name.clone(),
                instances: def
                    .instances
                    .values()
                    .map(|r| (r.name.clone(), r.is_started()))
                    .collect(),
            })
            .collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        modules
    }

    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.defs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.inner.defs.lock().contains_key(name)
    }

    /// Names of the tracked instances of `name`, or `None` if it is not defined.
    pub fn instance_names(&self, name: &str) -> Option<Vec<String>> {
        self.inner
            .defs
            .lock()
            .get(name)
            .map(|def| def.instances.keys().cloned().collect())
    }

    /// Multi-instance view of this registry.
    pub fn instances(&self) -> InstanceManager<'_> {
        InstanceManager::new(self)
    }

    pub(crate) fn report(&self, err: CoreError) -> Result<(), CoreError> {
        self.inner.reporter.report(err)
    }

    /// Returns the existing record or instantiates and records a new one.
    fn ensure_record(
        &self,
        name: &str,
        instance_name: &str,
    ) -> Result<Option<Arc<InstanceRecord>>, CoreError> {
        let existing = {
            let defs = self.inner.defs.lock();
            defs.get(name)
                .map(|def| def.instances.get(instance_name).cloned())
        };
        match existing {
            None => {
                self.report(CoreError::not_found(name))?;
                return Ok(None);
            }
            Some(Some(record)) => return Ok(Some(record)),
            Some(None) => {}
        }

        let Some(instance) = self.instantiate(name)? else {
            return Ok(None);
        };

        let mut defs = self.inner.defs.lock();
        let Some(def) = defs.get_mut(name) else {
            // Destroyed while the creator ran.
            return Ok(None);
        };
        let record = def
            .instances
            .entry(instance_name.to_string())
            .or_insert_with(|| Arc::new(InstanceRecord::new(instance_name, instance)))
            .clone();
        Ok(Some(record))
    }

    pub(crate) fn remove_record(&self, name: &str, instance_name: &str) {
        if let Some(def) = self.inner.defs.lock().get_mut(name) {
            def.instances.remove(instance_name);
        }
        tracing::debug!(module = name, instance = instance_name, "Module instance destroyed");
    }

    pub(crate) fn remove_definition(&self, name: &str) {
        self.inner.defs.lock().remove(name);
        tracing::debug!(module = name, "Module destroyed");
    }
}
