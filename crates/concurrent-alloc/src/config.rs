//! Heap configuration.

use std::time::Duration;

use crate::error::HeapError;
use crate::heap::{KB, MB, PAGE_SIZE, WORD_SIZE};

pub const DEFAULT_RESERVATION_SIZE: usize = 64 * MB;
pub const DEFAULT_LAB_SIZE: usize = 4 * KB;
pub const DEFAULT_MAX_LAB_SIZE: usize = 32 * KB;
pub const DEFAULT_MAX_LAB_OBJECT_SIZE: usize = 2 * KB;
pub const DEFAULT_STRESS_SAFEPOINT_INTERVAL: usize = 10;
pub const DEFAULT_STRESS_DELAY: Duration = Duration::from_millis(100);

/// Sizing of the old space and its linear allocation buffers.
///
/// Every field is public; call [`HeapConfig::validate`] (or let
/// [`Heap::new`](crate::Heap::new) do it) after changing any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes reserved for the old space. A multiple of [`PAGE_SIZE`].
    pub reservation_size: usize,
    /// Smallest slice requested when replenishing a LAB.
    pub lab_size: usize,
    /// Largest slice requested when replenishing a LAB.
    pub max_lab_size: usize,
    /// Objects larger than this bypass the LAB.
    pub max_lab_object_size: usize,
    /// Allows scheduling the stress allocation task.
    pub stress_concurrent_allocation: bool,
    /// Stress iterations between two safepoint checks.
    pub stress_safepoint_interval: usize,
    /// Delay before the stress task runs again.
    pub stress_delay: Duration,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            reservation_size: DEFAULT_RESERVATION_SIZE,
            lab_size: DEFAULT_LAB_SIZE,
            max_lab_size: DEFAULT_MAX_LAB_SIZE,
            max_lab_object_size: DEFAULT_MAX_LAB_OBJECT_SIZE,
            stress_concurrent_allocation: false,
            stress_safepoint_interval: DEFAULT_STRESS_SAFEPOINT_INTERVAL,
            stress_delay: DEFAULT_STRESS_DELAY,
        }
    }
}

impl HeapConfig {
    /// Check the sizing constraints the allocator relies on.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] naming the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), HeapError> {
        let invalid = |msg: String| Err(HeapError::InvalidConfig(msg));

        if self.reservation_size == 0 || self.reservation_size % PAGE_SIZE != 0 {
            return invalid(format!(
                "reservation_size {} is not a non-zero multiple of {PAGE_SIZE}",
                self.reservation_size
            ));
        }
        for (name, value) in [
            ("lab_size", self.lab_size),
            ("max_lab_size", self.max_lab_size),
            ("max_lab_object_size", self.max_lab_object_size),
        ] {
            if value == 0 || value % WORD_SIZE != 0 {
                return invalid(format!("{name} {value} is not a non-zero word multiple"));
            }
        }
        if self.lab_size > self.max_lab_size {
            return invalid(format!(
                "lab_size {} exceeds max_lab_size {}",
                self.lab_size, self.max_lab_size
            ));
        }
        if self.max_lab_size > PAGE_SIZE {
            return invalid(format!(
                "max_lab_size {} exceeds the page size {PAGE_SIZE}",
                self.max_lab_size
            ));
        }
        if self.max_lab_object_size + WORD_SIZE > self.lab_size {
            return invalid(format!(
                "max_lab_object_size {} plus alignment fill does not fit lab_size {}",
                self.max_lab_object_size, self.lab_size
            ));
        }
        if self.stress_safepoint_interval == 0 {
            return invalid("stress_safepoint_interval must be non-zero".to_owned());
        }
        Ok(())
    }
}
