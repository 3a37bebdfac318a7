//! # Adapter Registry
//!
//! Explicit map from adapter id to attached adapter. Hosts own one registry
//! and route probe, interrupt, deferred-work and detach entry points through
//! it; nothing in the engine keeps a global adapter list.
//!
//! Interrupt routing reads the map, so every writer masks local interrupts
//! while it holds the write lock.

use crate::adapter::Adapter;
use crate::config::AdapterConfig;
use crate::error::{CoreError, CoreResult};
use crate::transport::Transport;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use megasas_hal::{without_interrupts, DmaAllocator, IrqReturn, Timer};
use spin::RwLock;

/// Adapter identifier (host number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdapterId(pub u32);

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "megasas{}", self.0)
    }
}

/// Registry of attached adapters
pub struct AdapterRegistry {
    adapters: RwLock<BTreeMap<AdapterId, Arc<Adapter>>>,
    next_id: AtomicU32,
}

impl AdapterRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            adapters: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Attach a controller, start it and register it under a fresh id
    pub fn attach(
        &self,
        config: AdapterConfig,
        transport: Box<dyn Transport>,
        timer: Arc<dyn Timer>,
        dma: Arc<dyn DmaAllocator>,
    ) -> CoreResult<Arc<Adapter>> {
        let id = AdapterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let adapter = Adapter::attach(id, config, transport, timer, dma)?;
        self.register(Arc::clone(&adapter))?;
        if let Err(e) = adapter.start() {
            without_interrupts(|| self.adapters.write().remove(&id));
            adapter.shutdown();
            return Err(e);
        }
        Ok(adapter)
    }

    /// Register an adapter that was attached elsewhere
    pub fn register(&self, adapter: Arc<Adapter>) -> CoreResult<()> {
        let id = adapter.id();
        let family = adapter.family();
        without_interrupts(|| {
            let mut adapters = self.adapters.write();
            if adapters.contains_key(&id) {
                return Err(CoreError::AlreadyExists);
            }
            adapters.insert(id, adapter);
            Ok(())
        })?;
        log::info!("{}: registered ({} controller)", id, family);
        Ok(())
    }

    /// Shut an adapter down and forget it
    pub fn detach(&self, id: AdapterId) -> CoreResult<()> {
        let adapter = without_interrupts(|| self.adapters.write().remove(&id)).ok_or(CoreError::NotFound)?;
        adapter.shutdown();
        log::info!("{}: detached", id);
        Ok(())
    }

    /// Look up an adapter
    pub fn get(&self, id: AdapterId) -> Option<Arc<Adapter>> {
        self.adapters.read().get(&id).cloned()
    }

    /// Registered ids, ascending
    pub fn ids(&self) -> Vec<AdapterId> {
        self.adapters.read().keys().copied().collect()
    }

    /// Number of registered adapters
    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    /// Whether no adapter is registered
    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Route an interrupt to its adapter
    pub fn handle_interrupt(&self, id: AdapterId) -> IrqReturn {
        match self.adapters.read().get(&id) {
            Some(adapter) => adapter.handle_interrupt(),
            None => IrqReturn::None,
        }
    }

    /// Run an adapter's deferred work
    pub fn run_deferred(&self, id: AdapterId) -> CoreResult<usize> {
        let adapter = self.get(id).ok_or(CoreError::NotFound)?;
        Ok(adapter.run_deferred())
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.ids())
            .finish()
    }
}
