//! # Corekit - a tiny modular runtime
//!
//! Modules are defined by name with a list of tool names and a creator. The creator
//! receives the requested tools and returns a [`ModuleObject`]: data fields plus
//! methods. The [`ModuleRegistry`] drives each module through
//! `Defined → Instantiated → Started ⇄ Stopped → Destroyed`.
//!
//! ## Basic example
//!
//! ```rust,ignore
//! use corekit::{Core, ModuleObject};
//! use serde_json::{json, Value};
//!
//! let core = Core::new();
//! core.registry().define("counter", &[], |_tools| {
//!     Ok(ModuleObject::new()
//!         .field("count", 0)
//!         .method("onStart", |this, args| {
//!             this.set("count", args[0]["n"].clone());
//!             Ok(Value::Null)
//!         }))
//! })?;
//!
//! core.registry().start("counter", json!({ "n": 5 }))?;
//! ```
//!
//! ## Inheritance
//!
//! [`ModuleRegistry::inherit`] composes a module from its ancestors. A method that
//! overrides a parent method reaches the parent through [`Instance::call_super`].
//!
//! ## Error isolation
//!
//! Outside debug mode every module method is decorated: an `Err` is logged and
//! swallowed. In debug mode errors propagate to the caller unchanged. Panics in
//! methods, bus handlers and deferred tasks are caught and treated as errors.

mod compose;
pub mod error;
pub mod instance;
pub mod instances;
pub mod method;
pub mod object;
pub mod registry;
pub mod reporter;
pub mod runtime;
pub mod runloop;
pub mod tools;
pub mod unwind;

pub use runtime::Core;
pub use error::{ConfigError, CoreError};
pub use instance::Instance;
pub use instances::InstanceManager;
pub use method::{Method, MethodFn};
pub use object::{ModuleObject, Property};
pub use registry::{Creator, InstanceRecord, ModuleInfo, ModuleRegistry};
pub use reporter::{DebugFlag, ErrorReporter};
pub use runloop::{Scheduler, Task, TickQueue, TokioScheduler};
pub use tools::{RequestId, Tool, ToolFactory, ToolFactoryFn, Tools};
pub use unwind::catch_panic;
