//! Named string transformations that `EX` can apply to a tuple.
//!
//! The table is fixed when the server starts and never changes afterwards, so
//! lookups need no locking. Transforms run while the store lock is held and
//! must therefore stay pure and cheap.

use std::collections::BTreeMap;

/// A pure text transformation.
pub type Transform = fn(&str) -> String;

/// One registered service.
#[derive(Debug, Clone, Copy)]
pub struct Service {
    pub id: &'static str,
    pub description: &'static str,
    transform: Transform,
}

impl Service {
    pub fn apply(&self, input: &str) -> String {
        (self.transform)(input)
    }
}

/// Read-only lookup table from service id to transform.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: BTreeMap<&'static str, Service>,
}

impl ServiceRegistry {
    /// An empty registry. Every `EX` against it answers `NO-SERVICE`.
    pub fn empty() -> Self {
        Self {
            services: BTreeMap::new(),
        }
    }

    /// The four services the server ships with.
    pub fn builtin() -> Self {
        Self::empty()
            .with("1", "convert to uppercase", upper)
            .with("2", "reverse the string", reverse)
            .with("3", "count characters", length)
            .with("4", "duplicate the string", duplicate)
    }

    /// Adds a service, replacing any previous one with the same id.
    pub fn with(
        mut self,
        id: &'static str,
        description: &'static str,
        transform: Transform,
    ) -> Self {
        self.services.insert(
            id,
            Service {
                id,
                description,
                transform,
            },
        );
        self
    }

    pub fn get(&self, id: &str) -> Option<&Service> {
        self.services.get(id)
    }

    /// Services in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn upper(input: &str) -> String {
    input.to_uppercase()
}

fn reverse(input: &str) -> String {
    input.chars().rev().collect()
}

// Byte length, matching what clients of the line protocol count.
fn length(input: &str) -> String {
    input.len().to_string()
}

fn duplicate(input: &str) -> String {
    format!("{input} {input}")
}
