//! Inheritance composer: builds one object out of a module and its ancestors.

use std::collections::{HashMap, HashSet};

use crate::error::CoreError;
use crate::object::ModuleObject;
use crate::registry::{Creator, ModuleDefinition};
use crate::tools::{ToolFactory, Tools};

pub(crate) struct ChainLevel {
    name: String,
    tool_names: Vec<String>,
    creator: Creator,
}

/// Root-first list of the definitions a module is composed from.
pub(crate) struct SuperChain {
    levels: Vec<ChainLevel>,
}

/// Result of folding a super chain.
pub(crate) struct Composed {
    pub object: ModuleObject,
    /// Tools handed to each level, root first.
    pub tools: Vec<Tools>,
}

impl SuperChain {
    /// Walks `super` links from `name` upwards.
    ///
    /// Returns `Ok(None)` if `name` itself is not defined. A missing ancestor ends the
    /// chain there.
    pub fn resolve(
        defs: &HashMap<String, ModuleDefinition>,
        name: &str,
    ) -> Result<Option<Self>, CoreError> {
        if !defs.contains_key(name) {
            return Ok(None);
        }

        let mut levels = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name);

        while let Some(level_name) = current {
            let Some(def) = defs.get(level_name) else {
                tracing::warn!(
                    module = name,
                    ancestor = level_name,
                    "Ancestor is no longer defined"
                );
                break;
            };
            if !seen.insert(level_name) {
                return Err(CoreError::InheritanceCycle {
                    module: name.to_string(),
                });
            }
            levels.push(ChainLevel {
                name: def.name.clone(),
                tool_names: def.tool_names.clone(),
                creator: def.creator.clone(),
            });
            current = def.super_name.as_deref();
        }

        levels.reverse();
        Ok(Some(Self { levels }))
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Runs every level's creator with its own tools and merges the results into one
    /// object, starting from an empty accumulator.
    pub fn compose(self, tools: &ToolFactory) -> Result<Composed, CoreError> {
        let mut object = ModuleObject::new();
        let mut injected = Vec::with_capacity(self.levels.len());

        for level in self.levels {
            let level_tools = tools.resolve(&level.tool_names);
            let level_object = (level.creator)(&level_tools).map_err(|source| CoreError::Creator {
                module: level.name.clone(),
                source,
            })?;
            object.merge(level_object);
            injected.push(level_tools);
        }

        Ok(Composed {
            object,
            tools: injected,
        })
    }
}
