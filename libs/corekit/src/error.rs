use thiserror::Error;

/// Rejected registrations. Returned by `define`, `inherit` and tool `register`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("module '{0}' is already defined")]
    DuplicateModule(String),
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
    #[error("module '{0}' cannot inherit from itself")]
    SelfInheritance(String),
    #[error("module '{module}' inherits from unknown module '{super_name}'")]
    UnknownSuper { module: String, super_name: String },
}

/// Structured errors for module operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("the module \"{module}\" is not defined!")]
    NotFound { module: String },

    #[error("module \"{module}\" has no method \"{method}\"")]
    MissingMethod { module: String, method: String },

    #[error("error in module \"{module}\" executing method \"{method}\": {source}")]
    Method {
        module: String,
        method: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("creator of module \"{module}\" failed: {source}")]
    Creator {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("inheritance chain of module \"{module}\" is cyclic")]
    InheritanceCycle { module: String },

    /// A message reported while the debug flag was set.
    #[error("{0}")]
    Reported(String),
}

impl CoreError {
    pub fn not_found(module: impl Into<String>) -> Self {
        Self::NotFound {
            module: module.into(),
        }
    }

    /// Turn a failed lifecycle hook into a `CoreError`, unwrapping a missing-method error.
    pub(crate) fn from_hook(module: &str, method: &str, err: anyhow::Error) -> Self {
        match err.downcast::<CoreError>() {
            Ok(core) => core,
            Err(source) => Self::Method {
                module: module.to_string(),
                method: method.to_string(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_module() {
        let err = CoreError::not_found("chart");
        assert_eq!(err.to_string(), "the module \"chart\" is not defined!");
    }

    #[test]
    fn hook_error_keeps_typed_core_errors() {
        let missing = anyhow::Error::new(CoreError::MissingMethod {
            module: "m".into(),
            method: "onStart".into(),
        });
        assert!(matches!(
            CoreError::from_hook("m", "onStart", missing),
            CoreError::MissingMethod { .. }
        ));

        let other = CoreError::from_hook("m", "onStop", anyhow::anyhow!("boom"));
        match other {
            CoreError::Method { module, method, source } => {
                assert_eq!(module, "m");
                assert_eq!(method, "onStop");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
