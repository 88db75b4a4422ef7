//! State shared between the transport, decode and render threads.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::media::types::{CursorImage, CursorState, MouseMode};
use crate::protocol::{CURSOR_CACHE_ENTRIES, CursorBitmap, CursorInfo, CursorShape};
use crate::smoother::CtSmoother;

bitflags! {
    /// Why the render thread was woken.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenderWake: u8 {
        const FRAME      = 1 << 0;
        const CURSOR     = 1 << 1;
        const MOUSE_MODE = 1 << 2;
        const STRETCH    = 1 << 3;
    }
}

// ── CursorStore ──────────────────────────────────────────────────

/// Cursor bitmaps received from the host, by dedup id.
///
/// Scoped to one pipeline instance, like the host's cache, and bounded
/// by the same [`CURSOR_CACHE_ENTRIES`].
#[derive(Debug, Default)]
pub struct CursorStore {
    bitmaps: HashMap<u32, Arc<CursorBitmap>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Turn a wire cursor into renderer state, remembering new bitmaps.
    /// `None` if it references a bitmap this instance never received.
    pub fn resolve(&mut self, info: CursorInfo) -> Option<CursorState> {
        let image = match info.shape {
            CursorShape::Preset(id) => CursorImage::Preset(id),
            CursorShape::Bitmap { bitmap, dedup_id } => {
                let full = self.bitmaps.len() >= CURSOR_CACHE_ENTRIES;
                if full && !self.bitmaps.contains_key(&dedup_id) {
                    debug!("cursor store full, starting over");
                    self.bitmaps.clear();
                }
                let bitmap = Arc::new(bitmap);
                self.bitmaps.insert(dedup_id, bitmap.clone());
                CursorImage::Bitmap(bitmap)
            }
            CursorShape::Cached(id) => match self.bitmaps.get(&id) {
                Some(bitmap) => CursorImage::Bitmap(bitmap.clone()),
                None => {
                    warn!(dedup_id = id, "unknown cursor id");
                    return None;
                }
            },
        };
        Some(CursorState {
            x: info.x,
            y: info.y,
            visible: info.visible,
            image,
        })
    }
}

// ── RenderSlot ───────────────────────────────────────────────────

/// Everything guarded by the render lock.
#[derive(Debug)]
pub struct RenderSlot {
    pub smoother: CtSmoother,
    pub wake: RenderWake,
    pub cursors: CursorStore,
    pub cursor: Option<CursorState>,
    pub mouse_mode: MouseMode,
    pub stretch: bool,
}

impl RenderSlot {
    pub fn new(stretch: bool) -> Self {
        Self {
            smoother: CtSmoother::new(),
            wake: RenderWake::empty(),
            cursors: CursorStore::new(),
            cursor: None,
            mouse_mode: MouseMode::default(),
            stretch,
        }
    }

    /// Consume the pending wake reasons.
    pub fn take_wake(&mut self) -> RenderWake {
        std::mem::replace(&mut self.wake, RenderWake::empty())
    }
}
