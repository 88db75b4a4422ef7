//! GPU device ownership and the shared context lock.
//!
//! Renderers (client) and capturers (host) own the device and hold an
//! [`OwnedDevice`]. Encoders and decoders only ever receive a
//! [`BorrowedDevice`]: a copyable, comparable handle with no destructor.
//! Dropping a borrowed handle never releases anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

// ── OwnedDevice ──────────────────────────────────────────────────

/// The owning side of a device/context handle.
#[derive(Debug)]
pub struct OwnedDevice {
    id: u64,
    label: String,
}

impl OwnedDevice {
    /// Allocate a fresh device identity.
    pub fn new(label: impl Into<String>) -> Self {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        debug!(device = id, %label, "device created");
        Self { id, label }
    }

    /// Hand out a non-owning reference to this device.
    pub fn borrow(&self) -> BorrowedDevice {
        BorrowedDevice { id: self.id }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for OwnedDevice {
    fn drop(&mut self) {
        debug!(device = self.id, label = %self.label, "device released");
    }
}

// ── BorrowedDevice ───────────────────────────────────────────────

/// Non-owning device handle given to codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BorrowedDevice {
    id: u64,
}

impl BorrowedDevice {
    /// A handle that refers to no device (CPU-only paths).
    pub const NONE: BorrowedDevice = BorrowedDevice { id: 0 };

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_none(&self) -> bool {
        self.id == 0
    }
}

// ── GpuContextLock ───────────────────────────────────────────────

/// The single mutex serialising every touch of one pipeline's GPU
/// context.
///
/// The decode thread holds it around `decode()`, the render thread
/// around `render()`, and decoders may wire their library's internal
/// lock hooks to it through `Decoder::bind_context_lock`.
#[derive(Debug, Clone, Default)]
pub struct GpuContextLock(Arc<Mutex<()>>);

impl GpuContextLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock()
    }

    /// Whether both handles guard the same context.
    pub fn same_as(&self, other: &GpuContextLock) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
