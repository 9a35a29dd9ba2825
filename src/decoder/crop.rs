// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mapping of the stream crop rectangle through the rotator.
//!
//! Any combination of a quarter-turn rotation and a mirroring is one of eight transforms of the
//! picture (the symmetries of a rectangle). The rectangle of interest has to be moved accordingly
//! so it still covers the visible area once the picture has been transformed.

use crate::MirrorDirection;
use crate::Rect;
use crate::Resolution;
use crate::Rotation;

/// Returns which of the eight picture transforms `rotation` and `mirror` amount to.
///
/// Transforms 0 to 3 are pure rotations (0, 270, 180 and 90 degrees clockwise), 4 and 5 are
/// horizontal and vertical flips, 6 and 7 are the transpositions along each diagonal.
pub fn transform_index(rotation: Rotation, mirror: MirrorDirection) -> u8 {
    use MirrorDirection::*;

    match (rotation, mirror) {
        (Rotation::None, None) => 0,
        (Rotation::None, Vertical) => 5,
        (Rotation::None, Horizontal) => 4,
        (Rotation::None, Both) => 2,
        (Rotation::Rotate90, None) => 3,
        (Rotation::Rotate90, Vertical) => 7,
        (Rotation::Rotate90, Horizontal) => 6,
        (Rotation::Rotate90, Both) => 1,
        (Rotation::Rotate180, None) => 2,
        (Rotation::Rotate180, Vertical) => 4,
        (Rotation::Rotate180, Horizontal) => 5,
        (Rotation::Rotate180, Both) => 0,
        (Rotation::Rotate270, None) => 1,
        (Rotation::Rotate270, Vertical) => 6,
        (Rotation::Rotate270, Horizontal) => 7,
        (Rotation::Rotate270, Both) => 3,
    }
}

/// Maps `crop`, expressed in a frame buffer of size `frame`, through the transform applied by
/// the rotator. An empty rectangle means no cropping and is returned unchanged.
pub fn remap_crop(
    crop: Rect,
    rotation: Rotation,
    mirror: MirrorDirection,
    frame: Resolution,
) -> Rect {
    if crop.is_empty() {
        return crop;
    }

    let w = frame.width;
    let h = frame.height;
    let Rect {
        left,
        top,
        right,
        bottom,
    } = crop;

    match transform_index(rotation, mirror) {
        1 => Rect::new(top, w.saturating_sub(right), bottom, w.saturating_sub(left)),
        2 => Rect::new(
            w.saturating_sub(right),
            h.saturating_sub(bottom),
            w.saturating_sub(left),
            h.saturating_sub(top),
        ),
        3 => Rect::new(h.saturating_sub(bottom), left, h.saturating_sub(top), right),
        4 => Rect::new(w.saturating_sub(right), top, w.saturating_sub(left), bottom),
        5 => Rect::new(left, h.saturating_sub(bottom), right, h.saturating_sub(top)),
        6 => Rect::new(top, left, bottom, right),
        7 => Rect::new(
            h.saturating_sub(bottom),
            w.saturating_sub(right),
            h.saturating_sub(top),
            w.saturating_sub(left),
        ),
        _ => crop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Resolution = Resolution {
        width: 1920,
        height: 1088,
    };
    const CROP: Rect = Rect {
        left: 10,
        top: 20,
        right: 1900,
        bottom: 1080,
    };

    #[test]
    fn no_transform_is_identity() {
        assert_eq!(
            remap_crop(CROP, Rotation::None, MirrorDirection::None, FRAME),
            CROP
        );
        assert_eq!(
            remap_crop(CROP, Rotation::Rotate180, MirrorDirection::Both, FRAME),
            CROP
        );
    }

    #[test]
    fn empty_crop_is_unchanged() {
        for rotation in [Rotation::Rotate90, Rotation::Rotate270] {
            assert!(remap_crop(Rect::default(), rotation, MirrorDirection::Both, FRAME).is_empty());
        }
    }

    #[test]
    fn quarter_turns_are_inverses() {
        for mirror in [MirrorDirection::None, MirrorDirection::Both] {
            let turned = remap_crop(CROP, Rotation::Rotate90, mirror, FRAME);
            assert_eq!(turned.width(), CROP.height());
            assert_eq!(turned.height(), CROP.width());
            let back = remap_crop(turned, Rotation::Rotate270, mirror, FRAME.transposed());
            assert_eq!(back, CROP, "{:?}", mirror);

            let turned = remap_crop(CROP, Rotation::Rotate270, mirror, FRAME);
            let back = remap_crop(turned, Rotation::Rotate90, mirror, FRAME.transposed());
            assert_eq!(back, CROP, "{:?}", mirror);
        }
    }

    #[test]
    fn half_turn_is_an_involution() {
        let turned = remap_crop(CROP, Rotation::Rotate180, MirrorDirection::None, FRAME);
        assert_eq!(turned, Rect::new(20, 8, 1910, 1068));
        assert_eq!(
            remap_crop(turned, Rotation::Rotate180, MirrorDirection::None, FRAME),
            CROP
        );
    }

    #[test]
    fn quarter_turn_with_horizontal_mirror_transposes() {
        assert_eq!(
            transform_index(Rotation::Rotate90, MirrorDirection::Horizontal),
            6
        );
        assert_eq!(
            remap_crop(CROP, Rotation::Rotate90, MirrorDirection::Horizontal, FRAME),
            Rect::new(20, 10, 1080, 1900)
        );
    }

    #[test]
    fn transform_table_covers_all_combinations() {
        let mut seen = [0usize; 8];
        for rotation in [
            Rotation::None,
            Rotation::Rotate90,
            Rotation::Rotate180,
            Rotation::Rotate270,
        ] {
            for mirror in [
                MirrorDirection::None,
                MirrorDirection::Vertical,
                MirrorDirection::Horizontal,
                MirrorDirection::Both,
            ] {
                seen[transform_index(rotation, mirror) as usize] += 1;
            }
        }
        assert_eq!(seen, [2; 8]);
    }
}
