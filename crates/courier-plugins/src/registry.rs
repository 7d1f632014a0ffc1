//! Command registry with versioned atomic reload.
//!
//! The index is built completely aside and published with a single
//! swap, so concurrent lookups see either the previous or the new
//! complete set, never a partial one.

use crate::{Command, CommandSpec};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

struct Index {
    by_name: HashMap<String, Arc<dyn Command>>,
    /// Primary patterns in registration order, for menus and
    /// introspection.
    patterns: Vec<String>,
}

impl Index {
    fn build(set: Vec<Arc<dyn Command>>) -> Self {
        let mut by_name: HashMap<String, Arc<dyn Command>> = HashMap::new();
        let mut patterns = Vec::new();

        for command in set {
            let spec = command.spec();
            if spec.pattern.is_empty() {
                warn!("skipping command with empty pattern");
                continue;
            }
            if by_name.contains_key(spec.pattern) {
                warn!("skipping duplicate command pattern '{}'", spec.pattern);
                continue;
            }
            by_name.insert(spec.pattern.to_string(), command.clone());
            patterns.push(spec.pattern.to_string());

            for alias in spec.aliases {
                if by_name.contains_key(*alias) {
                    warn!("skipping alias '{alias}' of '{}': name taken", spec.pattern);
                    continue;
                }
                by_name.insert(alias.to_string(), command.clone());
            }
        }

        Self { by_name, patterns }
    }
}

/// Shared command registry. Lookups are lock-free after cloning the
/// current index handle; `reload` replaces the whole index at once.
pub struct Registry {
    index: RwLock<Arc<Index>>,
}

impl Registry {
    pub fn new(set: Vec<Arc<dyn Command>>) -> Self {
        let index = Index::build(set);
        info!("command registry loaded: {} commands", index.patterns.len());
        Self {
            index: RwLock::new(Arc::new(index)),
        }
    }

    fn current(&self) -> Arc<Index> {
        self.index.read().unwrap().clone()
    }

    /// Look up a command by pattern or alias.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.current().by_name.get(name).cloned()
    }

    /// Primary patterns in registration order.
    pub fn patterns(&self) -> Vec<String> {
        self.current().patterns.clone()
    }

    /// Descriptors of every registered command, in registration order.
    pub fn descriptors(&self) -> Vec<CommandSpec> {
        let index = self.current();
        index
            .patterns
            .iter()
            .filter_map(|p| index.by_name.get(p))
            .map(|c| *c.spec())
            .collect()
    }

    /// Rebuild the index from a new command set and publish it.
    pub fn reload(&self, set: Vec<Arc<dyn Command>>) {
        let next = Arc::new(Index::build(set));
        let count = next.patterns.len();
        *self.index.write().unwrap() = next;
        info!("command registry reloaded: {count} commands");
    }
}
