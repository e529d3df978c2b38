//! Handler registry.

use crate::r#trait::{ExecutionMode, ResourceHandler};
use converge_core::Category;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors raised while registering handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Another handler already owns the category
    #[error("category {category} is already handled by {existing}")]
    CategoryClaimed {
        /// Contested category
        category: Category,
        /// Name of the handler that owns it
        existing: String,
    },
}

/// A registered handler with its effective invocation flags.
#[derive(Clone)]
pub struct Registration {
    handler: Arc<dyn ResourceHandler>,
    mode: ExecutionMode,
    concurrent_writes: bool,
}

impl Registration {
    /// Register with the handler's declared flags.
    pub fn new(handler: Arc<dyn ResourceHandler>) -> Self {
        let mode = handler.execution_mode();
        let concurrent_writes = handler.concurrent_writes();
        Self {
            handler,
            mode,
            concurrent_writes,
        }
    }

    /// Override the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override whether distinct keys may be written in parallel.
    pub fn with_concurrent_writes(mut self, concurrent: bool) -> Self {
        self.concurrent_writes = concurrent;
        self
    }

    /// The handler.
    pub fn handler(&self) -> &Arc<dyn ResourceHandler> {
        &self.handler
    }

    /// Category served.
    pub fn category(&self) -> Category {
        self.handler.category()
    }

    /// Handler name.
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Effective execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Effective concurrency flag.
    pub fn concurrent_writes(&self) -> bool {
        self.concurrent_writes
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name())
            .field("category", &self.category())
            .field("mode", &self.mode)
            .field("concurrent_writes", &self.concurrent_writes)
            .finish()
    }
}

/// Category-to-handler map. Registration order is invocation order.
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    entries: Vec<Registration>,
    by_category: HashMap<Category, usize>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with its declared flags.
    pub fn register(&mut self, handler: Arc<dyn ResourceHandler>) -> Result<(), RegistryError> {
        self.register_with(Registration::new(handler))
    }

    /// Register a handler with explicit flags.
    pub fn register_with(&mut self, registration: Registration) -> Result<(), RegistryError> {
        let category = registration.category();
        if let Some(&index) = self.by_category.get(&category) {
            return Err(RegistryError::CategoryClaimed {
                category,
                existing: self.entries[index].name().to_string(),
            });
        }
        tracing::debug!(
            handler = registration.name(),
            %category,
            mode = %registration.mode(),
            concurrent = registration.concurrent_writes(),
            "registered handler"
        );
        self.by_category.insert(category, self.entries.len());
        self.entries.push(registration);
        Ok(())
    }

    /// Handler for a category.
    pub fn get(&self, category: Category) -> Option<&Registration> {
        self.by_category.get(&category).map(|&i| &self.entries[i])
    }

    /// Registrations in invocation order.
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter()
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
