//! Hierarchical key-value store shared across node executions.
//!
//! Contexts live in an arena owned by a [`ContextManager`] and are addressed
//! by [`ContextId`]. A child reads through to its ancestors; writes always
//! land on the context they were made on, so sibling contexts cannot clobber
//! each other.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Unique identifier for a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ContextEntry {
    name: String,
    parent: Option<ContextId>,
    children: Vec<ContextId>,
    values: HashMap<String, Value>,
}

#[derive(Default)]
struct ContextArena {
    entries: RwLock<HashMap<ContextId, ContextEntry>>,
}

impl ContextArena {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ContextId, ContextEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ContextId, ContextEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, name: String, parent: Option<ContextId>) -> Result<ContextId> {
        let id = ContextId::new();
        let mut entries = self.write();

        if let Some(parent_id) = parent {
            let parent_entry = entries
                .get_mut(&parent_id)
                .ok_or_else(|| EngineError::control(format!("Context {} is destroyed", parent_id)))?;
            parent_entry.children.push(id);
        }

        entries.insert(
            id,
            ContextEntry {
                name,
                parent,
                children: Vec::new(),
                values: HashMap::new(),
            },
        );

        Ok(id)
    }

    fn remove_tree(&self, id: ContextId) -> usize {
        let mut entries = self.write();

        let parent = match entries.get(&id) {
            Some(entry) => entry.parent,
            None => return 0,
        };
        if let Some(parent_entry) = parent.and_then(|p| entries.get_mut(&p)) {
            parent_entry.children.retain(|child| *child != id);
        }

        let mut removed = 0;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(entry) = entries.remove(&current) {
                stack.extend(entry.children);
                removed += 1;
            }
        }
        removed
    }
}

/// Owner of a context tree
#[derive(Clone, Default)]
pub struct ContextManager {
    arena: Arc<ContextArena>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root context
    pub fn create_context(&self, name: impl Into<String>) -> Context {
        let name = name.into();
        let id = ContextId::new();
        self.arena.write().insert(
            id,
            ContextEntry {
                name,
                parent: None,
                children: Vec::new(),
                values: HashMap::new(),
            },
        );
        Context {
            id,
            arena: self.arena.clone(),
        }
    }

    /// Create a child of an existing context
    pub fn create_child(&self, parent: &Context, name: impl Into<String>) -> Result<Context> {
        parent.create_child(name)
    }

    /// Look up a live context by id
    pub fn get_context(&self, id: ContextId) -> Option<Context> {
        self.arena.read().contains_key(&id).then(|| Context {
            id,
            arena: self.arena.clone(),
        })
    }

    /// Destroy a context and all of its descendants
    pub fn destroy_context(&self, id: ContextId) -> bool {
        self.arena.remove_tree(id) > 0
    }

    /// Number of live contexts in the tree
    pub fn context_count(&self) -> usize {
        self.arena.read().len()
    }
}

/// Handle to one context in a tree
#[derive(Clone)]
pub struct Context {
    id: ContextId,
    arena: Arc<ContextArena>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish()
    }
}

impl Context {
    /// Standalone root context with its own tree
    pub fn root(name: impl Into<String>) -> Self {
        ContextManager::new().create_context(name)
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.arena.read().get(&self.id).map(|e| e.name.clone())
    }

    pub fn is_alive(&self) -> bool {
        self.arena.read().contains_key(&self.id)
    }

    /// Manager for the tree this context belongs to
    pub fn manager(&self) -> ContextManager {
        ContextManager {
            arena: self.arena.clone(),
        }
    }

    pub fn parent(&self) -> Option<Context> {
        let parent = self.arena.read().get(&self.id).and_then(|e| e.parent)?;
        Some(Context {
            id: parent,
            arena: self.arena.clone(),
        })
    }

    pub fn create_child(&self, name: impl Into<String>) -> Result<Context> {
        let id = self.arena.insert(name.into(), Some(self.id))?;
        Ok(Context {
            id,
            arena: self.arena.clone(),
        })
    }

    /// Read a key, falling back to ancestors
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.arena.read();
        let mut current = Some(self.id);

        while let Some(id) = current {
            let entry = entries.get(&id)?;
            if let Some(value) = entry.values.get(key) {
                return Some(value.clone());
            }
            current = entry.parent;
        }

        None
    }

    /// Read a key and deserialize it
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Write a key on this context only
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let mut entries = self.arena.write();
        let entry = entries
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::control(format!("Context {} is destroyed", self.id)))?;
        entry.values.insert(key.into(), value.into());
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn has_local(&self, key: &str) -> bool {
        self.arena
            .read()
            .get(&self.id)
            .map(|e| e.values.contains_key(key))
            .unwrap_or(false)
    }

    /// Remove a local key. Inherited entries are untouched.
    pub fn delete(&self, key: &str) -> bool {
        self.arena
            .write()
            .get_mut(&self.id)
            .map(|e| e.values.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Remove every local key
    pub fn clear(&self) {
        if let Some(entry) = self.arena.write().get_mut(&self.id) {
            entry.values.clear();
        }
    }

    pub fn local_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .arena
            .read()
            .get(&self.id)
            .map(|e| e.values.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Local and inherited keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.to_map().into_iter().map(|(k, _)| k).collect()
    }

    /// Flattened view with nearer contexts shadowing ancestors
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        let entries = self.arena.read();
        let mut chain = Vec::new();
        let mut current = Some(self.id);
        while let Some(id) = current {
            match entries.get(&id) {
                Some(entry) => {
                    chain.push(entry);
                    current = entry.parent;
                }
                None => break,
            }
        }

        let mut map = serde_json::Map::new();
        for entry in chain.into_iter().rev() {
            for (key, value) in &entry.values {
                map.insert(key.clone(), value.clone());
            }
        }
        map
    }

    pub fn children(&self) -> Vec<Context> {
        self.arena
            .read()
            .get(&self.id)
            .map(|e| {
                e.children
                    .iter()
                    .map(|id| Context {
                        id: *id,
                        arena: self.arena.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Detach from the parent and destroy this context and its descendants
    pub fn destroy(&self) -> bool {
        let removed = self.arena.remove_tree(self.id);
        if removed > 0 {
            tracing::trace!(context_id = %self.id, removed, "Destroyed context");
        }
        removed > 0
    }
}
