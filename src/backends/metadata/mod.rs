// SPDX-License-Identifier: GPL-3.0-only

//! Per-frame metadata collaborator
//!
//! Metadata lives in reference-counted entries handed out by a
//! [`MetadataStore`]. A [`MetadataHandle`] is a smart handle: clones share the
//! entry and the entry goes back to its store when the last clone is dropped,
//! so every stage that owns a handle releases it exactly once by dropping it.
//!
//! ```text
//!  dispatcher ──acquire──▶ PipelineRequest ──▶ pipeline ──▶ PipelineResult
//!                                                               │
//!                       caller ◀── WireBlob ◀── aggregator ◀────┘
//! ```

pub mod pool;

pub use pool::MetadataPool;

use crate::errors::MetadataError;
use crate::multicam::types::{
    CameraId, FrameNumber, LpmMode, SyncMode, WeightedRegion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Result type for metadata operations
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Metadata tags understood by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tag {
    // ===== Standard controls / results =====
    ZoomRatio,
    LensFocalLength,
    SensorSensitivity,
    AeRegions,
    AfRegions,
    AwbRegions,
    AeState,
    AfState,
    SensorTimestamp,

    // ===== Scene statistics =====
    LuxIndex,
    FocusDistanceCm,

    // ===== Vendor tags injected per pipeline =====
    /// True on the master pipeline's request
    MasterCamera,
    /// Low-power state of every physical camera
    LowPowerMode,
    /// Requested hardware frame synchronisation
    SyncMode,
    /// Current/logical/master camera ids, sent once per pipeline
    CameraIdentity,
}

/// One-time identity injected into a pipeline's first request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraIdentity {
    pub current_camera_id: CameraId,
    pub logical_camera_id: CameraId,
    pub master_camera_id: CameraId,
}

/// Low-power request for one physical camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LpmEntry {
    pub camera_id: CameraId,
    pub mode: LpmMode,
}

/// Tag payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Regions(Vec<WeightedRegion>),
    Identity(CameraIdentity),
    LowPower(Vec<LpmEntry>),
    Sync(SyncMode),
}

impl TagValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TagValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value as float; integers widen
    pub fn as_float(&self) -> Option<f32> {
        match self {
            TagValue::Float(v) => Some(*v),
            TagValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_regions(&self) -> Option<&[WeightedRegion]> {
        match self {
            TagValue::Regions(r) => Some(r),
            _ => None,
        }
    }
}

/// Caller-side settings blob
pub type TagMap = BTreeMap<Tag, TagValue>;

/// Metadata encoded for delivery outside the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBlob(Vec<u8>);

impl WireBlob {
    pub fn encode(tags: &TagMap) -> MetadataResult<Self> {
        serde_json::to_vec(tags)
            .map(WireBlob)
            .map_err(|e| MetadataError::Encoding(e.to_string()))
    }

    pub fn decode(&self) -> MetadataResult<TagMap> {
        serde_json::from_slice(&self.0).map_err(|e| MetadataError::Decoding(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Invoked once when the last handle to an entry is dropped
pub(crate) trait ReleaseHook: Send + Sync {
    fn released(&self, entry_id: u64);
}

struct MetadataEntry {
    id: u64,
    frame_number: FrameNumber,
    tags: Mutex<TagMap>,
    hook: Option<Arc<dyn ReleaseHook>>,
}

impl Drop for MetadataEntry {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook.released(self.id);
        }
    }
}

/// Reference-counted handle to one metadata entry
#[derive(Clone)]
pub struct MetadataHandle {
    entry: Arc<MetadataEntry>,
}

impl MetadataHandle {
    /// Entry not backed by any pool; released when the last clone drops
    pub fn detached(frame_number: FrameNumber, tags: TagMap) -> Self {
        Self::with_hook(0, frame_number, tags, None)
    }

    pub(crate) fn with_hook(
        id: u64,
        frame_number: FrameNumber,
        tags: TagMap,
        hook: Option<Arc<dyn ReleaseHook>>,
    ) -> Self {
        Self {
            entry: Arc::new(MetadataEntry {
                id,
                frame_number,
                tags: Mutex::new(tags),
                hook,
            }),
        }
    }

    pub fn frame_number(&self) -> FrameNumber {
        self.entry.frame_number
    }

    pub fn get(&self, tag: Tag) -> Option<TagValue> {
        self.lock_tags().get(&tag).cloned()
    }

    pub fn set(&self, tag: Tag, value: TagValue) {
        self.lock_tags().insert(tag, value);
    }

    pub fn remove(&self, tag: Tag) -> Option<TagValue> {
        self.lock_tags().remove(&tag)
    }

    pub fn snapshot(&self) -> TagMap {
        self.lock_tags().clone()
    }

    fn lock_tags(&self) -> std::sync::MutexGuard<'_, TagMap> {
        self.entry.tags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MetadataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MetadataHandle(frame {}, {} tags)",
            self.entry.frame_number,
            self.lock_tags().len()
        )
    }
}

/// Metadata collaborator contract
///
/// All calls are synchronous and internally locked by the implementation.
pub trait MetadataStore: Send + Sync {
    /// Acquire an empty entry for `frame_number`, waiting a bounded time
    fn acquire(&self, frame_number: FrameNumber) -> MetadataResult<MetadataHandle>;

    /// Give up this owner's reference
    fn release(&self, handle: MetadataHandle) {
        drop(handle);
    }

    fn find_tag(&self, handle: &MetadataHandle, tag: Tag) -> Option<TagValue> {
        handle.get(tag)
    }

    fn set_tag(&self, handle: &MetadataHandle, tag: Tag, value: TagValue) {
        handle.set(tag, value);
    }

    fn translate_to_wire_format(&self, handle: &MetadataHandle) -> MetadataResult<WireBlob> {
        WireBlob::encode(&handle.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_blob_preserves_tags() {
        let mut tags = TagMap::new();
        tags.insert(Tag::SensorSensitivity, TagValue::Int(400));
        tags.insert(Tag::MasterCamera, TagValue::Bool(true));
        tags.insert(Tag::SyncMode, TagValue::Sync(SyncMode::HwSync));

        let blob = WireBlob::encode(&tags).unwrap();
        assert!(!blob.is_empty());
        assert_eq!(blob.decode().unwrap(), tags);
    }

    #[test]
    fn test_garbage_blob_fails_to_decode() {
        let blob = WireBlob(b"not json".to_vec());
        assert!(matches!(blob.decode(), Err(MetadataError::Decoding(_))));
    }

    #[test]
    fn test_handle_clones_share_entry() {
        let handle = MetadataHandle::detached(3, TagMap::new());
        let clone = handle.clone();
        clone.set(Tag::ZoomRatio, TagValue::Float(2.0));

        assert_eq!(handle.get(Tag::ZoomRatio), Some(TagValue::Float(2.0)));
        drop(clone);
        assert_eq!(handle.snapshot().len(), 1);
    }

    #[test]
    fn test_int_widens_to_float() {
        assert_eq!(TagValue::Int(50).as_float(), Some(50.0));
        assert_eq!(TagValue::Bool(true).as_float(), None);
    }
}
