//! The runtime bundle tying the debug flag, reporter, tools and registry together.

use std::sync::Arc;

use crate::registry::ModuleRegistry;
use crate::reporter::{DebugFlag, ErrorReporter};
use crate::tools::ToolFactory;

/// One runtime: debug flag, reporter, tool factory and module registry.
///
/// Hosts and tests build their own `Core`; there is no process-wide instance.
#[derive(Clone, Debug)]
pub struct Core {
    debug: DebugFlag,
    reporter: ErrorReporter,
    tools: Arc<ToolFactory>,
    registry: ModuleRegistry,
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl Core {
    pub fn new() -> Self {
        Self::with_debug_mode(false)
    }

    pub fn with_debug_mode(debug_mode: bool) -> Self {
        let debug = DebugFlag::new(debug_mode);
        let reporter = ErrorReporter::new(debug.clone());
        let tools = Arc::new(ToolFactory::new());
        let registry = ModuleRegistry::new(tools.clone(), reporter.clone());
        Self {
            debug,
            reporter,
            tools,
            registry,
        }
    }

    pub fn is_debug_mode(&self) -> bool {
        self.debug.is_enabled()
    }

    /// Takes effect for methods decorated and errors reported from now on.
    pub fn set_debug_mode(&self, enabled: bool) {
        self.debug.set(enabled);
        tracing::info!(target: "corekit", debug_mode = enabled, "Debug mode changed");
    }

    pub fn debug_flag(&self) -> &DebugFlag {
        &self.debug
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn tools(&self) -> &Arc<ToolFactory> {
        &self.tools
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }
}
