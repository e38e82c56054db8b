//! The shared tuple space.
//!
//! Every operation runs under one store-wide mutex. The blocking operations
//! (`read`, `take`, `execute`) check their condition and, when it is unmet,
//! register a waiter before the lock is released. A write that lands after the
//! check can therefore never slip past unnoticed: either it happened before the
//! check and the value is visible, or it happens after the registration and
//! its notification finds the waiter.
//!
//! Wakeups are broadcast to every waiter on a key. Woken tasks start over from
//! the top and race for the tuple under the lock; losers park again.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::service::ServiceRegistry;
use crate::waiters::WaitRegistry;

/// A key/value pair stored in the space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub key: String,
    pub value: String,
}

impl Tuple {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Failure modes of [`Space::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecuteError {
    /// The service id is not registered. The input tuple was left in place.
    #[error("no service registered under id '{0}'")]
    NoService(String),
}

type Tuples = BTreeMap<String, VecDeque<Tuple>>;

/// Tuple store plus the waiters parked on it.
///
/// Share one instance between connections through an `Arc`.
pub struct Space {
    tuples: Mutex<Tuples>,
    waiters: WaitRegistry,
    services: ServiceRegistry,
}

impl Space {
    pub fn new(services: ServiceRegistry) -> Self {
        Self {
            tuples: Mutex::new(BTreeMap::new()),
            waiters: WaitRegistry::new(),
            services,
        }
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Number of operations currently parked on a key.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Appends a tuple under `key` and wakes everyone waiting on it.
    pub fn write(&self, key: &str, value: &str) {
        {
            let mut tuples = self.lock();
            tuples
                .entry(key.to_string())
                .or_default()
                .push_back(Tuple::new(key, value));
        }
        info!(key, value, "tuple written");
        self.notify(key);
    }

    /// Returns the oldest value under `key` without removing it, waiting for
    /// one to be written if necessary.
    pub async fn read(&self, key: &str) -> String {
        let value = self
            .wait_for(key, |tuples| {
                tuples
                    .get(key)
                    .and_then(VecDeque::front)
                    .map(|tuple| tuple.value.clone())
            })
            .await;
        info!(key, value = %value, "tuple read");
        value
    }

    /// Removes and returns the oldest value under `key`, waiting for one to be
    /// written if necessary.
    pub async fn take(&self, key: &str) -> String {
        let tuple = self.wait_for(key, |tuples| pop_oldest(tuples, key)).await;
        info!(key, value = %tuple.value, "tuple taken");
        tuple.value
    }

    /// Waits for a tuple under `key_in`, transforms it with `service_id` and
    /// writes the result under `key_out`.
    ///
    /// An unknown service is reported once a tuple is available and leaves
    /// that tuple where it was.
    pub async fn execute(
        &self,
        key_in: &str,
        key_out: &str,
        service_id: &str,
    ) -> Result<(), ExecuteError> {
        let outcome = self
            .wait_for(key_in, |tuples| {
                if !has_tuple(tuples, key_in) {
                    return None;
                }
                let Some(service) = self.services.get(service_id) else {
                    return Some(Err(ExecuteError::NoService(service_id.to_string())));
                };
                let input = pop_oldest(tuples, key_in)?;
                let output = service.apply(&input.value);
                tuples
                    .entry(key_out.to_string())
                    .or_default()
                    .push_back(Tuple::new(key_out, output.clone()));
                Some(Ok((input.value, output)))
            })
            .await;

        match outcome {
            Ok((input, output)) => {
                info!(key_in, key_out, service_id, %input, %output, "service applied");
                self.notify(key_out);
                Ok(())
            }
            Err(err) => {
                warn!(key_in, service_id, "service not found");
                Err(err)
            }
        }
    }

    /// Copies the current contents for diagnostics.
    pub fn snapshot(&self) -> Snapshot {
        let tuples = self.lock();
        let entries = tuples
            .iter()
            .map(|(key, queue)| {
                let values = queue.iter().map(|tuple| tuple.value.clone()).collect();
                (key.clone(), values)
            })
            .collect();
        Snapshot { entries }
    }

    /// Runs `attempt` under the store lock until it yields a value, parking on
    /// `key` between attempts.
    async fn wait_for<T, F>(&self, key: &str, mut attempt: F) -> T
    where
        F: FnMut(&mut Tuples) -> Option<T>,
    {
        loop {
            let wake = {
                let mut tuples = self.lock();
                if let Some(found) = attempt(&mut *tuples) {
                    return found;
                }
                // Registered before the guard drops: a write cannot land in between.
                self.waiters.register(key)
            };

            debug!(key, "waiting for tuple");
            // The sender is only discarded after our receiver is gone, so an
            // error here cannot happen. Either way, re-check from scratch.
            let _ = wake.await;
        }
    }

    fn notify(&self, key: &str) {
        let woken = self.waiters.notify_all(key);
        if woken > 0 {
            debug!(key, woken, "woke waiters");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tuples> {
        self.tuples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Space {
    fn default() -> Self {
        Self::new(ServiceRegistry::builtin())
    }
}

fn has_tuple(tuples: &Tuples, key: &str) -> bool {
    tuples.get(key).is_some_and(|queue| !queue.is_empty())
}

fn pop_oldest(tuples: &mut Tuples, key: &str) -> Option<Tuple> {
    let queue = tuples.get_mut(key)?;
    let tuple = queue.pop_front();
    if queue.is_empty() {
        tuples.remove(key);
    }
    tuple
}

/// Point-in-time copy of the space, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub entries: BTreeMap<String, Vec<String>>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== TUPLE SPACE ===")?;
        if self.entries.is_empty() {
            writeln!(f, "(empty)")?;
        }
        for (key, values) in &self.entries {
            writeln!(f, "Key: {key}")?;
            for (index, value) in values.iter().enumerate() {
                writeln!(f, "  {}. {value}", index + 1)?;
            }
        }
        write!(f, "===================")
    }
}
