//! Folio Cache Library
//!
//! Bounded page payload cache and render slot pool for progressive document
//! viewing.
//!
//! Both structures are owned by a single control loop: they are mutated
//! through `&mut self` and each operation completes its eviction or
//! reclamation before returning.

pub mod page;
pub mod slots;

pub use page::{
    CacheBound, CacheEntry, CacheStats, CapacityExceeded, EvictionFocus, PageCache, PageNumber,
    PagePayload,
};
pub use slots::{Reclaimed, RenderSlot, RenderSlotPool, SlotGrant, SlotIndex, SlotStats};
