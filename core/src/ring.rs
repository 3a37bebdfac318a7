//! # Reply Ring
//!
//! The completion queue shared with firmware: `entries` 32-bit context
//! slots plus a producer index (written by firmware) and a consumer index
//! (written by the host), all in coherent memory. Draining walks from
//! consumer to producer, hands each context to the caller, and publishes
//! the new consumer index once at the end.

use crate::error::{CoreError, CoreResult};
use crate::mfi::MEGASAS_ADPRESET_INPROG_SIGN;
use core::fmt;
use megasas_hal::{DmaAllocator, DmaRegion, IrqMutex, IrqMutexGuard, PhysAddr};

/// Host/firmware completion queue
pub struct ReplyRing {
    queue: DmaRegion,
    indices: DmaRegion,
    producer: DmaRegion,
    consumer: DmaRegion,
    entries: u32,
    lock: IrqMutex<()>,
}

impl ReplyRing {
    /// Allocate a ring with `entries` slots (max firmware commands + 1)
    pub fn new(dma: &dyn DmaAllocator, entries: u32) -> CoreResult<Self> {
        if entries < 2 {
            return Err(CoreError::InvalidRequest);
        }
        let queue = dma.alloc_coherent(entries as usize * 4, 4)?;
        let indices = match dma.alloc_coherent(8, 4) {
            Ok(region) => region,
            Err(e) => {
                dma.free_coherent(&queue);
                return Err(e.into());
            }
        };
        Ok(Self {
            producer: indices.slice(0, 4)?,
            consumer: indices.slice(4, 4)?,
            queue,
            indices,
            entries,
            lock: IrqMutex::new(()),
        })
    }

    /// Number of slots
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Bus address of the context array
    pub fn queue_phys(&self) -> PhysAddr {
        self.queue.phys()
    }

    /// Bus address of the producer index
    pub fn producer_phys(&self) -> PhysAddr {
        self.producer.phys()
    }

    /// Bus address of the consumer index
    pub fn consumer_phys(&self) -> PhysAddr {
        self.consumer.phys()
    }

    /// Current producer index
    pub fn producer(&self) -> u32 {
        self.producer.read_u32(0).unwrap_or(0)
    }

    /// Current consumer index
    pub fn consumer(&self) -> u32 {
        self.consumer.read_u32(0).unwrap_or(0)
    }

    /// Drain every posted context, in ring order
    ///
    /// Contexts are checked against `limit` (the pool size). An
    /// out-of-range context stops the drain: the consumer index is
    /// published up to the offending slot and the context is returned as a
    /// protocol violation. A ring stamped for a reset drains nothing.
    pub fn drain<F>(&self, limit: u32, mut dispatch: F) -> CoreResult<usize>
    where
        F: FnMut(u32),
    {
        let _guard = self.lock.lock();
        let producer = self.producer.read_u32(0)?;
        let mut consumer = self.consumer.read_u32(0)?;
        if consumer == MEGASAS_ADPRESET_INPROG_SIGN {
            return Ok(0);
        }
        if producer >= self.entries || consumer >= self.entries {
            return Err(CoreError::ProtocolViolation { context: producer });
        }

        let mut drained = 0;
        while consumer != producer {
            let context = self.queue.read_u32(consumer as usize * 4)?;
            if context >= limit {
                self.consumer.write_u32(0, consumer)?;
                return Err(CoreError::ProtocolViolation { context });
            }
            consumer = (consumer + 1) % self.entries;
            dispatch(context);
            drained += 1;
        }

        self.consumer.write_u32(0, consumer)?;
        Ok(drained)
    }

    /// Reset the indices after a controller reset
    ///
    /// `keep_position` resumes at the producer index instead of zero.
    pub fn reset(&self, keep_position: bool) {
        let _guard = self.lock.lock();
        if keep_position {
            let producer = self.producer();
            let _ = self.consumer.write_u32(0, producer % self.entries);
        } else {
            let _ = self.producer.write_u32(0, 0);
            let _ = self.consumer.write_u32(0, 0);
        }
    }

    /// Keep the ring from being drained or reset while the guard lives
    pub(crate) fn hold(&self) -> IrqMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Stamp the consumer index with the reset-in-progress signature
    ///
    /// Requires the ring hold, so no drain can publish over the stamp.
    pub(crate) fn mark_reset_in_progress(&self, _hold: &IrqMutexGuard<'_, ()>) {
        let _ = self.consumer.write_u32(0, MEGASAS_ADPRESET_INPROG_SIGN);
    }

    /// Give the ring memory back to the allocator
    pub(crate) fn free_memory(&self, dma: &dyn DmaAllocator) {
        dma.free_coherent(&self.queue);
        dma.free_coherent(&self.indices);
    }

    #[cfg(test)]
    pub(crate) fn post(&self, context: u32) {
        let producer = self.producer();
        self.queue.write_u32(producer as usize * 4, context).unwrap();
        self.producer.write_u32(0, (producer + 1) % self.entries).unwrap();
    }
}

impl fmt::Debug for ReplyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyRing")
            .field("entries", &self.entries)
            .field("producer", &self.producer())
            .field("consumer", &self.consumer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use megasas_hal::HostDmaAllocator;

    fn ring(entries: u32) -> ReplyRing {
        ReplyRing::new(&HostDmaAllocator::new(), entries).unwrap()
    }

    #[test]
    fn test_drain_in_order() {
        let ring = ring(8);
        for ctx in [3, 1, 2] {
            ring.post(ctx);
        }
        let mut seen = Vec::new();
        assert_eq!(ring.drain(8, |ctx| seen.push(ctx)).unwrap(), 3);
        assert_eq!(seen, [3, 1, 2]);
        assert_eq!(ring.consumer(), 3);
        assert_eq!(ring.drain(8, |_| panic!("empty ring")).unwrap(), 0);
    }

    #[test]
    fn test_drain_wraps() {
        let ring = ring(5);
        for ctx in 0..4 {
            ring.post(ctx);
        }
        ring.drain(8, |_| {}).unwrap();
        for ctx in [10, 11, 12] {
            ring.post(ctx);
        }
        let mut seen = Vec::new();
        ring.drain(16, |ctx| seen.push(ctx)).unwrap();
        assert_eq!(seen, [10, 11, 12]);
        assert_eq!(ring.consumer(), 2);
        assert_eq!(ring.producer(), 2);
    }

    #[test]
    fn test_out_of_range_context_stops_drain() {
        let ring = ring(8);
        ring.post(1);
        ring.post(42);
        ring.post(2);
        let mut seen = Vec::new();
        let err = ring.drain(4, |ctx| seen.push(ctx)).unwrap_err();
        assert_eq!(err, CoreError::ProtocolViolation { context: 42 });
        assert_eq!(seen, [1]);
        assert_eq!(ring.consumer(), 1);
    }

    #[test]
    fn test_stamped_ring_drains_nothing() {
        let ring = ring(8);
        ring.post(1);
        ring.post(2);
        ring.mark_reset_in_progress(&ring.hold());

        assert_eq!(ring.drain(8, |_| panic!("drained during reset")), Ok(0));
        assert_eq!(ring.consumer(), MEGASAS_ADPRESET_INPROG_SIGN);

        ring.reset(true);
        ring.post(3);
        let mut seen = Vec::new();
        ring.drain(8, |ctx| seen.push(ctx)).unwrap();
        assert_eq!(seen, [3]);
    }

    #[test]
    fn test_reset_modes() {
        let ring = ring(8);
        ring.post(0);
        ring.post(1);
        ring.mark_reset_in_progress(&ring.hold());
        assert_eq!(ring.consumer(), MEGASAS_ADPRESET_INPROG_SIGN);

        ring.reset(true);
        assert_eq!(ring.consumer(), 2);
        assert_eq!(ring.producer(), 2);

        ring.reset(false);
        assert_eq!(ring.consumer(), 0);
        assert_eq!(ring.producer(), 0);
    }
}
