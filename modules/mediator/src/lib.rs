//! Mediator - topic publish/subscribe for corekit modules.
//!
//! [`install`] registers the `"mediator"` tool. Each request yields a
//! [`MediatorHandle`] whose subscriber id is the tool request id.
//!
//! ```rust,ignore
//! let core = Core::new();
//! let queue = Arc::new(TickQueue::new());
//! mediator::install(&core, queue.clone())?;
//!
//! core.registry().define("clock", &["mediator"], |tools| {
//!     let bus = tools.get::<MediatorHandle>(0).context("no mediator")?;
//!     Ok(ModuleObject::new().method("onStart", move |_, _| {
//!         bus.publish("clock:tick", json!({ "at": 0 }), false);
//!         Ok(Value::Null)
//!     }))
//! })?;
//! ```

use std::sync::Arc;

use corekit::{ConfigError, Core, Scheduler, Tool};

mod bus;
mod envelope;

pub use bus::{Handler, MediatorHandle, MessageBus, Topics};
pub use envelope::{payload, Envelope, Payload};

/// Tool name the bus is registered under.
pub const TOOL_NAME: &str = "mediator";

/// Creates a bus delivering on `scheduler` and registers it as the `"mediator"` tool.
pub fn install(core: &Core, scheduler: Arc<dyn Scheduler>) -> Result<Arc<MessageBus>, ConfigError> {
    let bus = MessageBus::new(scheduler, core.reporter().clone());
    let factory_bus = Arc::clone(&bus);
    core.tools()
        .register(TOOL_NAME, move |id| Ok(Some(Tool::new(factory_bus.handle(id)))))?;
    tracing::debug!(tool = TOOL_NAME, "Mediator installed");
    Ok(bus)
}
