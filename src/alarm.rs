//! Callback registries for the memory collaborators.
//!
//! The memory alarm calls into the store when a watermark crosses, and
//! the store periodically reports its footprint to the queue-mode
//! manager. Both sides register plain callbacks and get a token back;
//! the registry holds weak references, so a callback whose owner is
//! gone is silently dropped on the next invocation instead of being
//! called into a void.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Target mode requested by the memory alarm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryMode {
    /// Keep the location index on disk.
    Disk,
    /// Keep the location index in RAM.
    Mixed,
}

/// One periodic footprint report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryReport {
    pub bytes: u64,
    /// No commands arrived since the previous report tick.
    pub hibernating: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AlarmToken(u64);

struct Inner<A> {
    next_token: u64,
    slots: HashMap<u64, Weak<dyn Fn(A) + Send + Sync>>,
}

pub struct CallbackRegistry<A> {
    inner: Mutex<Inner<A>>,
}

impl<A: Copy> CallbackRegistry<A> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_token: 0,
                slots: HashMap::new(),
            }),
        }
    }

    pub fn register(&self, callback: &Arc<dyn Fn(A) + Send + Sync>) -> AlarmToken {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let token = inner.next_token;
        inner.next_token += 1;
        inner.slots.insert(token, Arc::downgrade(callback));
        AlarmToken(token)
    }

    pub fn unregister(&self, token: AlarmToken) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.slots.remove(&token.0);
    }

    /// Invoke every live callback with `arg`, dropping dead ones.
    pub fn invoke(&self, arg: A) {
        let callbacks: Vec<Arc<dyn Fn(A) + Send + Sync>> = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            inner.slots.retain(|_, weak| weak.strong_count() > 0);
            inner.slots.values().filter_map(Weak::upgrade).collect()
        };
        for callback in callbacks {
            callback(arg);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: Copy> Default for CallbackRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry the memory alarm raises into.
pub type AlarmRegistry = CallbackRegistry<MemoryMode>;

/// Registry the store reports footprints into.
pub type ReportRegistry = CallbackRegistry<MemoryReport>;
