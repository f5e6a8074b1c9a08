//! The raw object a module creator returns, and the merge rule used to compose
//! objects along an inheritance chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::instance::Instance;
use crate::method::Method;

#[derive(Clone, Debug)]
pub enum Property {
    Data(Value),
    Method(Method),
}

impl Property {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Property::Data(v) => Some(v),
            Property::Method(_) => None,
        }
    }

    pub fn as_method(&self) -> Option<&Method> {
        match self {
            Property::Method(m) => Some(m),
            Property::Data(_) => None,
        }
    }
}

/// Property bag produced by a module creator.
///
/// ```rust,ignore
/// ModuleObject::new()
///     .field("count", 0)
///     .method("onStart", |this, args| {
///         this.set("count", args[0]["n"].clone());
///         Ok(Value::Null)
///     })
/// ```
#[derive(Clone, Debug, Default)]
pub struct ModuleObject {
    props: BTreeMap<String, Property>,
}

impl ModuleObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(name.into(), Property::Data(value.into()));
        self
    }

    pub fn method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Arc<Instance>, &[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.with_method(name, Method::new(f))
    }

    pub fn with_method(mut self, name: impl Into<String>, method: Method) -> Self {
        self.props.insert(name.into(), Property::Method(method));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, prop: Property) -> Option<Property> {
        self.props.insert(name.into(), prop)
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.props.get(name)
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Merges a child level into this accumulated object.
    ///
    /// - data object over data object: deep merge, untouched siblings survive
    /// - method over method: override node, the previous method becomes the child's super
    /// - anything else: the child's property replaces the current one
    pub fn merge(&mut self, level: ModuleObject) {
        for (name, incoming) in level.props {
            let merged = match (self.props.remove(&name), incoming) {
                (
                    Some(Property::Data(Value::Object(mut base))),
                    Property::Data(Value::Object(child)),
                ) => {
                    merge_objects(&mut base, child);
                    Property::Data(Value::Object(base))
                }
                (Some(Property::Method(parent)), Property::Method(child)) => {
                    Property::Method(Method::override_with(parent, child))
                }
                (_, incoming) => incoming,
            };
            self.props.insert(name, merged);
        }
    }

    pub(crate) fn into_parts(self) -> (Map<String, Value>, BTreeMap<String, Method>) {
        let mut fields = Map::new();
        let mut methods = BTreeMap::new();
        for (name, prop) in self.props {
            match prop {
                Property::Data(v) => {
                    fields.insert(name, v);
                }
                Property::Method(m) => {
                    methods.insert(name, m);
                }
            }
        }
        (fields, methods)
    }
}

fn merge_objects(dest: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        match value {
            Value::Object(child) => match dest.get_mut(&key) {
                Some(Value::Object(base)) => merge_objects(base, child),
                _ => {
                    dest.insert(key, Value::Object(child));
                }
            },
            other => {
                dest.insert(key, other);
            }
        }
    }
}
