//! Multi-instance lifecycle: N named instances of one definition, each with its own
//! object and started flag.

use serde_json::Value;

use crate::error::CoreError;
use crate::registry::ModuleRegistry;

/// Multi-instance view over a [`ModuleRegistry`], see [`ModuleRegistry::instances`].
#[derive(Clone, Copy, Debug)]
pub struct InstanceManager<'a> {
    registry: &'a ModuleRegistry,
}

impl<'a> InstanceManager<'a> {
    pub(crate) fn new(registry: &'a ModuleRegistry) -> Self {
        Self { registry }
    }

    /// Starts `instance_name` of `name`. `onStart` receives `[start_data, instance_name]`.
    pub fn start_instance(
        &self,
        name: &str,
        instance_name: &str,
        start_data: Value,
    ) -> Result<bool, CoreError> {
        self.registry.start_record(
            name,
            instance_name,
            vec![start_data, Value::String(instance_name.to_string())],
        )
    }

    /// Stops one instance; `and_destroy` removes only that instance record.
    pub fn stop_instance(
        &self,
        name: &str,
        instance_name: &str,
        and_destroy: bool,
    ) -> Result<bool, CoreError> {
        let Some(record) = self.registry.get_instance(name, Some(instance_name))? else {
            return Ok(false);
        };
        self.registry.stop_record(name, &record, and_destroy)?;

        if and_destroy {
            self.registry.remove_record(name, instance_name);
            return Ok(true);
        }
        Ok(!record.is_started())
    }

    /// Starts every tracked instance of `name`, or the default instance if none exist.
    pub fn start(&self, name: &str, start_data: Value) -> Result<bool, CoreError> {
        let names = self.tracked(name)?;
        if names.is_empty() {
            return self.registry.start(name, start_data);
        }

        let mut all = true;
        for instance_name in names {
            all &= self.start_instance(name, &instance_name, start_data.clone())?;
        }
        Ok(all)
    }

    /// Stops every tracked instance of `name`, or the default instance if none exist.
    ///
    /// With `and_destroy`, the definition is removed once every instance succeeded.
    pub fn stop(&self, name: &str, and_destroy: bool) -> Result<bool, CoreError> {
        let names = self.tracked(name)?;
        if names.is_empty() {
            return self.registry.stop(name, and_destroy);
        }

        let mut all = true;
        for instance_name in names {
            all &= self.stop_instance(name, &instance_name, and_destroy)?;
        }
        if and_destroy && all {
            self.registry.remove_definition(name);
        }
        Ok(all)
    }

    fn tracked(&self, name: &str) -> Result<Vec<String>, CoreError> {
        match self.registry.instance_names(name) {
            Some(names) => Ok(names),
            None => {
                self.registry.report(CoreError::not_found(name))?;
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ModuleObject;
    use crate::reporter::{DebugFlag, ErrorReporter};
    use crate::tools::ToolFactory;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ModuleRegistry {
        let reg = ModuleRegistry::new(
            Arc::new(ToolFactory::new()),
            ErrorReporter::new(DebugFlag::new(false)),
        );
        reg.define("m", &[], |_| {
            Ok(ModuleObject::new()
                .field("n", 0)
                .field("label", "")
                .method("onStart", |this, args| {
                    this.set("n", args[0]["n"].clone());
                    this.set("label", args.get(1).cloned().unwrap_or(Value::Null));
                    Ok(Value::Null)
                })
                .method("onStop", |_, _| Ok(Value::Null)))
        })
        .unwrap();
        reg
    }

    #[test]
    fn instances_are_independent() {
        let reg = registry();
        let mgr = reg.instances();
        assert!(mgr.start_instance("m", "a", json!({ "n": 1 })).unwrap());
        assert!(mgr.start_instance("m", "b", json!({ "n": 2 })).unwrap());

        assert!(mgr.stop_instance("m", "a", false).unwrap());

        let a = reg.get_instance("m", Some("a")).unwrap().unwrap();
        let b = reg.get_instance("m", Some("b")).unwrap().unwrap();
        assert!(!a.is_started());
        assert!(b.is_started());
        assert_eq!(b.instance().get("n"), Some(json!(2)));
        assert_eq!(b.instance().get("label"), Some(json!("b")));
        assert!(!Arc::ptr_eq(a.instance(), b.instance()));
    }

    #[test]
    fn start_and_stop_cover_every_tracked_instance() {
        let reg = registry();
        let mgr = reg.instances();
        mgr.start_instance("m", "a", json!({ "n": 1 })).unwrap();
        mgr.start_instance("m", "b", json!({ "n": 2 })).unwrap();

        assert!(mgr.stop("m", false).unwrap());
        assert_eq!(
            reg.get_modules()[0].instances,
            vec![("a".to_string(), false), ("b".to_string(), false)]
        );

        assert!(mgr.start("m", json!({ "n": 7 })).unwrap());
        let a = reg.get_instance("m", Some("a")).unwrap().unwrap();
        assert_eq!(a.instance().get("n"), Some(json!(7)));
        assert!(reg.get_instance("m", None).unwrap().is_none());
    }

    #[test]
    fn start_without_instances_falls_back_to_default() {
        let reg = registry();
        let mgr = reg.instances();
        assert!(mgr.start("m", json!({ "n": 3 })).unwrap());
        let record = reg.get_instance("m", None).unwrap().unwrap();
        assert_eq!(record.instance().get("label"), Some(Value::Null));
        assert_eq!(reg.instance_names("m"), Some(vec!["m".to_string()]));
    }

    #[test]
    fn destroying_one_instance_keeps_the_definition() {
        let reg = registry();
        let mgr = reg.instances();
        mgr.start_instance("m", "a", json!({ "n": 1 })).unwrap();
        mgr.start_instance("m", "b", json!({ "n": 2 })).unwrap();

        assert!(mgr.stop_instance("m", "a", true).unwrap());
        assert_eq!(reg.instance_names("m"), Some(vec!["b".to_string()]));

        assert!(mgr.stop("m", true).unwrap());
        assert!(!reg.is_defined("m"));
    }

    #[test]
    fn stopping_an_unknown_instance_is_false() {
        let reg = registry();
        assert!(!reg.instances().stop_instance("m", "nope", false).unwrap());
        assert!(!reg.instances().stop("ghost", false).unwrap());
    }
}
