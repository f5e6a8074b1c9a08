//! Module methods as explicit call wrappers.
//!
//! A [`Method`] is either a native closure or an override node `{ child, parent }`
//! built when a child module redefines a parent's method. Invoking an override binds
//! the parent as the instance's current super for the duration of the child call.
//!
//! The optional guard label marks a method as decorated: failures (panics included)
//! are logged through the instance's reporter and swallowed. Guarding is idempotent.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::instance::Instance;
use crate::unwind::catch_panic;

/// Signature of a native module method.
pub type MethodFn = dyn Fn(&Arc<Instance>, &[Value]) -> anyhow::Result<Value> + Send + Sync;

#[derive(Clone)]
enum Body {
    Native(Arc<MethodFn>),
    Override(Arc<Override>),
}

struct Override {
    child: Method,
    parent: Method,
}

#[derive(Clone)]
pub struct Method {
    body: Body,
    /// Error prefix once the method is decorated; `None` for a raw method.
    guard: Option<Arc<str>>,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("depth", &self.depth())
            .field("decorated", &self.is_decorated())
            .finish()
    }
}

impl Method {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Arc<Instance>, &[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            body: Body::Native(Arc::new(f)),
            guard: None,
        }
    }

    /// `child` with `parent` reachable through [`Instance::call_super`].
    pub fn override_with(parent: Method, child: Method) -> Self {
        Self {
            body: Body::Override(Arc::new(Override { child, parent })),
            guard: None,
        }
    }

    pub fn is_decorated(&self) -> bool {
        self.guard.is_some()
    }

    /// Number of chain levels behind this method (1 for a plain method).
    pub fn depth(&self) -> usize {
        match &self.body {
            Body::Native(_) => 1,
            Body::Override(o) => 1 + o.parent.depth(),
        }
    }

    /// Wraps the method in error isolation. A decorated method is returned as is.
    pub fn decorate(self, error_prefix: impl Into<Arc<str>>) -> Self {
        if self.is_decorated() {
            return self;
        }
        Self {
            guard: Some(error_prefix.into()),
            ..self
        }
    }

    pub fn invoke(&self, this: &Arc<Instance>, args: &[Value]) -> anyhow::Result<Value> {
        let Some(prefix) = &self.guard else {
            return self.invoke_body(this, args);
        };
        match catch_panic(|| self.invoke_body(this, args)) {
            Ok(value) => Ok(value),
            Err(e) => {
                this.reporter().log(format!("{prefix}{e}"));
                Ok(Value::Null)
            }
        }
    }

    fn invoke_body(&self, this: &Arc<Instance>, args: &[Value]) -> anyhow::Result<Value> {
        match &self.body {
            Body::Native(f) => f(this, args),
            Body::Override(o) => {
                let _scope = SuperScope::bind(this, o.parent.clone());
                o.child.invoke(this, args)
            }
        }
    }
}

/// Restores the previous super slot on drop, unwinding included.
struct SuperScope<'a> {
    this: &'a Instance,
    previous: Option<Method>,
}

impl<'a> SuperScope<'a> {
    fn bind(this: &'a Instance, parent: Method) -> Self {
        let previous = this.bind_super(Some(parent));
        Self { this, previous }
    }
}

impl Drop for SuperScope<'_> {
    fn drop(&mut self) {
        self.this.bind_super(self.previous.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decorate_is_idempotent() {
        let m = Method::new(|_, _| Ok(Value::Null)).decorate("first: ");
        let again = m.clone().decorate("second: ");
        assert!(again.is_decorated());
        assert_eq!(again.guard.as_deref(), Some("first: "));
    }

    #[test]
    fn depth_counts_override_levels() {
        let base = Method::new(|_, _| Ok(Value::Null));
        let mid = Method::override_with(base, Method::new(|_, _| Ok(Value::Null)));
        let top = Method::override_with(mid, Method::new(|_, _| Ok(Value::Null)));
        assert_eq!(top.depth(), 3);
    }

    fn instance_with(methods: Vec<(&str, Method)>) -> Arc<Instance> {
        let mut object = crate::object::ModuleObject::new();
        for (name, method) in methods {
            object = object.with_method(name, method);
        }
        Instance::build(
            "panicky",
            object,
            crate::reporter::ErrorReporter::default(),
            false,
            None,
        )
    }

    #[test]
    fn decorated_panics_are_swallowed() {
        let m = Method::new(|_, _| -> anyhow::Result<Value> { panic!("method blew up") })
            .decorate("Error: ");
        let inst = instance_with(vec![("boom", m.clone())]);
        assert_eq!(m.invoke(&inst, &[]).unwrap(), Value::Null);
    }

    #[test]
    fn super_slot_is_restored_after_a_panic() {
        let parent = Method::new(|_, _| Ok(Value::from("parent")));
        let child = Method::new(|_, _| -> anyhow::Result<Value> { panic!("child blew up") });
        let guarded = Method::override_with(parent, child).decorate("Error: ");
        let plain = Method::new(|this, args| this.call_super(args));
        let inst = instance_with(vec![("op", guarded.clone()), ("plain", plain.clone())]);

        assert_eq!(guarded.invoke(&inst, &[]).unwrap(), Value::Null);
        assert!(plain.invoke(&inst, &[]).is_err());
    }
}
