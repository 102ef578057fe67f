// SPDX-License-Identifier: GPL-3.0-only

//! Cross-camera settings translation
//!
//! Metering regions are remapped through each camera's field-of-view
//! rectangle; sensitivity is mapped linearly between valid ranges. Settings go
//! from the reference camera to a pipeline's camera, result metadata goes the
//! other way.

use crate::backends::metadata::{Tag, TagMap, TagValue};
use crate::multicam::types::{CameraDescriptor, SensitivityRange, WeightedRegion};

const REGION_TAGS: [Tag; 3] = [Tag::AeRegions, Tag::AfRegions, Tag::AwbRegions];

/// Map a metering rectangle from `from`'s active array into `to`'s.
///
/// The result is clamped to the destination active array; the weight is kept.
pub fn translate_region(
    region: &WeightedRegion,
    from: &CameraDescriptor,
    to: &CameraDescriptor,
) -> WeightedRegion {
    let (src, dst) = (&from.fov_rect, &to.fov_rect);
    let scale_x = dst.width as f64 / src.width.max(1) as f64;
    let scale_y = dst.height as f64 / src.height.max(1) as f64;
    let offset_x = (to.calibration_offset.0 - from.calibration_offset.0) as f64;
    let offset_y = (to.calibration_offset.1 - from.calibration_offset.1) as f64;

    let map_x = |x: i32| dst.left as f64 + (x - src.left) as f64 * scale_x + offset_x;
    let map_y = |y: i32| dst.top as f64 + (y - src.top) as f64 * scale_y + offset_y;

    let bounds = &to.active_array;
    let clamp_x = |v: f64| (v.round() as i64).clamp(bounds.left as i64, bounds.right() as i64) as i32;
    let clamp_y = |v: f64| (v.round() as i64).clamp(bounds.top as i64, bounds.bottom() as i64) as i32;

    WeightedRegion {
        left: clamp_x(map_x(region.left)),
        top: clamp_y(map_y(region.top)),
        right: clamp_x(map_x(region.right)),
        bottom: clamp_y(map_y(region.bottom)),
        weight: region.weight,
    }
}

/// Linear sensitivity remap, clamped to the destination range
pub fn remap_sensitivity(value: i32, from: &SensitivityRange, to: &SensitivityRange) -> i32 {
    let from_span = from.span();
    if from_span <= 0 {
        return to.clamp(value);
    }
    let scaled = to.min as f64 + (value - from.min) as f64 * to.span() as f64 / from_span as f64;
    to.clamp(scaled.round() as i32)
}

/// Translate request settings written against `reference` for `target`'s pipeline
pub fn remap_logical_settings(
    settings: &TagMap,
    reference: &CameraDescriptor,
    target: &CameraDescriptor,
) -> TagMap {
    remap_tags(settings, reference, target)
}

/// Translate a pipeline's result metadata back into `reference`'s coordinates
pub fn remap_logical_result_metadata(
    metadata: &TagMap,
    source: &CameraDescriptor,
    reference: &CameraDescriptor,
) -> TagMap {
    remap_tags(metadata, source, reference)
}

fn remap_tags(tags: &TagMap, from: &CameraDescriptor, to: &CameraDescriptor) -> TagMap {
    if from.camera_id == to.camera_id {
        return tags.clone();
    }

    let mut out = tags.clone();

    if let Some(value) = tags.get(&Tag::SensorSensitivity).and_then(TagValue::as_int) {
        let mapped = remap_sensitivity(value as i32, &from.sensitivity, &to.sensitivity);
        out.insert(Tag::SensorSensitivity, TagValue::Int(mapped as i64));
    }

    for tag in REGION_TAGS {
        if let Some(regions) = tags.get(&tag).and_then(TagValue::as_regions) {
            let mapped = regions
                .iter()
                .map(|r| translate_region(r, from, to))
                .collect();
            out.insert(tag, TagValue::Regions(mapped));
        }
    }

    out
}
