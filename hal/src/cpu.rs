//! # CPU Waiting Primitives
//!
//! Device drivers poll hardware before the scheduler exists and spin on
//! completion flags afterwards. Both go through this trait so that the
//! driver never hardcodes a timing loop.

/// CPU-level delay and spin-wait support
pub trait CpuRelax: Send + Sync {
    /// Busy-wait for at least `us` microseconds
    fn delay_us(&self, us: u32);

    /// Pause the CPU inside a spin-wait loop
    #[inline]
    fn pause(&self) {
        core::hint::spin_loop();
    }

    /// Full memory barrier between descriptor writes and doorbell writes
    #[inline]
    fn memory_barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
