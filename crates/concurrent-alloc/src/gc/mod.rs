//! Collector-side state the allocator coordinates with.

pub mod collector;
pub mod incremental;
pub mod mark;
pub mod safepoint;

pub use collector::{GarbageCollector, SweepingCollector};
pub use incremental::IncrementalMarking;
pub use safepoint::{GlobalSafepoint, ParkedScope};
