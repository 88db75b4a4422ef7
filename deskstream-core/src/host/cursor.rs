//! Host-side cursor deduplication.
//!
//! Cursor bitmaps are keyed by a blake3 hash of their content. The
//! first time a bitmap is seen it is sent in full with a fresh dedup id;
//! afterwards only the id is sent. The cache belongs to one pipeline
//! instance, so a rebuilt host pipeline starts from an empty cache.
//!
//! A client rebuilt on its own starts with an empty store while this
//! cache lives on. The host invalidates the cache on every keyframe
//! request, which the owner sends after each client rebuild, so the
//! next snapshot goes out as a full bitmap again.

use std::collections::HashMap;

use tracing::debug;

use crate::media::types::{CursorSnapshot, CursorSource};
use crate::protocol::{CURSOR_CACHE_ENTRIES, CursorBitmap, CursorInfo, CursorShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShapeKey {
    Preset(u32),
    Dedup(u32),
}

/// Turns cursor snapshots into `CursorInfo` messages, sending only
/// changes.
#[derive(Debug, Default)]
pub struct CursorCache {
    ids: HashMap<blake3::Hash, u32>,
    next_id: u32,
    last: Option<(i32, i32, bool, ShapeKey)>,
}

impl CursorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bitmaps currently remembered.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Forget every bitmap and the last state sent. The next snapshot
    /// is sent in full, with a fresh dedup id.
    pub fn invalidate(&mut self) {
        self.ids.clear();
        self.last = None;
    }

    fn content_key(bitmap: &CursorBitmap) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&bitmap.width.to_le_bytes());
        hasher.update(&bitmap.height.to_le_bytes());
        hasher.update(&bitmap.hotspot_x.to_le_bytes());
        hasher.update(&bitmap.hotspot_y.to_le_bytes());
        hasher.update(&bitmap.data);
        hasher.finalize()
    }

    /// Process one snapshot. Returns the message to send, or `None`
    /// when nothing visible changed.
    pub fn update(&mut self, snapshot: CursorSnapshot) -> Option<CursorInfo> {
        let (key, shape) = match snapshot.image {
            CursorSource::Preset(id) => (ShapeKey::Preset(id), CursorShape::Preset(id)),
            CursorSource::Bitmap(bitmap) => {
                let hash = Self::content_key(&bitmap);
                match self.ids.get(&hash) {
                    Some(&id) => (ShapeKey::Dedup(id), CursorShape::Cached(id)),
                    None => {
                        if self.ids.len() >= CURSOR_CACHE_ENTRIES {
                            debug!("cursor cache full, starting over");
                            self.ids.clear();
                        }
                        let id = self.next_id;
                        self.next_id = self.next_id.wrapping_add(1);
                        self.ids.insert(hash, id);
                        (
                            ShapeKey::Dedup(id),
                            CursorShape::Bitmap {
                                bitmap,
                                dedup_id: id,
                            },
                        )
                    }
                }
            }
        };

        let state = (snapshot.x, snapshot.y, snapshot.visible, key);
        if self.last == Some(state) {
            return None;
        }
        self.last = Some(state);

        Some(CursorInfo {
            x: snapshot.x,
            y: snapshot.y,
            visible: snapshot.visible,
            shape,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bitmap(fill: u8) -> CursorSource {
        CursorSource::Bitmap(CursorBitmap {
            width: 2,
            height: 2,
            hotspot_x: 0,
            hotspot_y: 0,
            data: Bytes::from(vec![fill; 16]),
        })
    }

    fn bitmap_n(n: u32) -> CursorSource {
        CursorSource::Bitmap(CursorBitmap {
            width: 1,
            height: 1,
            hotspot_x: 0,
            hotspot_y: 0,
            data: Bytes::copy_from_slice(&n.to_le_bytes()),
        })
    }

    fn snap(x: i32, image: CursorSource) -> CursorSnapshot {
        CursorSnapshot {
            x,
            y: 0,
            visible: true,
            image,
        }
    }

    #[test]
    fn repeated_bitmap_is_sent_by_id() {
        let mut cache = CursorCache::new();
        let first = cache.update(snap(0, bitmap(1))).unwrap();
        let CursorShape::Bitmap { dedup_id, .. } = first.shape else {
            panic!("expected a full bitmap");
        };

        let moved = cache.update(snap(5, bitmap(1))).unwrap();
        assert_eq!(moved.shape, CursorShape::Cached(dedup_id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unchanged_cursor_sends_nothing() {
        let mut cache = CursorCache::new();
        assert!(cache.update(snap(1, CursorSource::Preset(3))).is_some());
        assert!(cache.update(snap(1, CursorSource::Preset(3))).is_none());
        assert!(cache.update(snap(1, CursorSource::Preset(4))).is_some());
    }

    #[test]
    fn invalidated_cache_resends_the_bitmap() {
        let mut cache = CursorCache::new();
        cache.update(snap(0, bitmap(1))).unwrap();
        assert!(cache.update(snap(0, bitmap(1))).is_none());

        cache.invalidate();
        assert!(cache.is_empty());
        let again = cache.update(snap(0, bitmap(1))).unwrap();
        let CursorShape::Bitmap { dedup_id, .. } = again.shape else {
            panic!("expected a full bitmap after invalidation");
        };
        assert_eq!(dedup_id, 1);
    }

    #[test]
    fn full_cache_starts_over() {
        let mut cache = CursorCache::new();
        for i in 0..CURSOR_CACHE_ENTRIES {
            cache.update(snap(i as i32, bitmap_n(i as u32))).unwrap();
        }
        assert_eq!(cache.len(), CURSOR_CACHE_ENTRIES);
        cache.update(snap(0, bitmap_n(u32::MAX))).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_bitmaps_get_distinct_ids() {
        let mut cache = CursorCache::new();
        let a = cache.update(snap(0, bitmap(1))).unwrap();
        let b = cache.update(snap(0, bitmap(2))).unwrap();
        match (a.shape, b.shape) {
            (
                CursorShape::Bitmap { dedup_id: ia, .. },
                CursorShape::Bitmap { dedup_id: ib, .. },
            ) => assert_ne!(ia, ib),
            other => panic!("unexpected shapes {other:?}"),
        }
    }
}
