// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel copies performed on decoded pictures before they are handed to an output sink.

use crate::Rect;

/// Size of an I420 picture of `width`x`height` pixels. Chroma planes of odd-sized pictures
/// cover the last column and line.
pub fn i420_size(width: usize, height: usize) -> usize {
    width * height + 2 * width.div_ceil(2) * height.div_ceil(2)
}

/// Converts the NV12 picture in `src` into I420 in `dst`.
///
/// Both pictures have `stride` bytes per luma line and `height` lines. The chroma lines of `src`
/// are interleaved Cb/Cr pairs, `stride` bytes long.
pub fn nv12_to_i420(src: &[u8], dst: &mut [u8], stride: usize, height: usize) {
    let y_size = stride * height;
    let uv_size = y_size / 4;
    let (dst_y_plane, dst_uv_planes) = dst.split_at_mut(y_size);
    let (dst_u_plane, dst_v_plane) = dst_uv_planes.split_at_mut(uv_size);

    // Copy Y.
    dst_y_plane.copy_from_slice(&src[..y_size]);

    // Split UV.
    let src_uv_lines = src[y_size..].chunks(stride).take(height / 2);
    let dst_u_lines = dst_u_plane.chunks_mut(stride / 2);
    let dst_v_lines = dst_v_plane.chunks_mut(stride / 2);
    for (src_line, (dst_u_line, dst_v_line)) in src_uv_lines.zip(dst_u_lines.zip(dst_v_lines)) {
        for (pair, (u, v)) in src_line
            .chunks_exact(2)
            .zip(dst_u_line.iter_mut().zip(dst_v_line.iter_mut()))
        {
            *u = pair[0];
            *v = pair[1];
        }
    }
}

/// Copies `height` lines of `width` bytes out of `src`, where lines start every `stride` bytes
/// from `offset`.
fn copy_plane(
    src: &[u8],
    dst: &mut Vec<u8>,
    offset: usize,
    stride: usize,
    width: usize,
    height: usize,
) {
    let Some(src) = src.get(offset..) else {
        return;
    };
    let src_lines = src
        .chunks(stride)
        .map(|line| &line[..width.min(line.len())])
        .take(height);
    for line in src_lines {
        dst.extend_from_slice(line);
    }
}

/// Extracts the `crop` area of the I420 picture in `src`, which is `width` pixels wide and
/// `height` lines high without padding. `width` and `height` are even.
pub fn crop_i420(src: &[u8], width: usize, height: usize, crop: Rect) -> Vec<u8> {
    let left = crop.left as usize;
    let top = crop.top as usize;
    let crop_width = (crop.width() as usize).min(width.saturating_sub(left));
    let crop_height = (crop.height() as usize).min(height.saturating_sub(top));

    let mut dst = Vec::with_capacity(i420_size(crop_width, crop_height));
    if crop_width == 0 || crop_height == 0 {
        return dst;
    }

    // Copy Y.
    copy_plane(src, &mut dst, width * top + left, width, crop_width, crop_height);

    let y_size = width * height;
    let uv_width = width / 2;
    let uv_offset = uv_width * (top / 2) + left / 2;

    // Copy U, then V.
    for plane_start in [y_size, y_size * 5 / 4] {
        copy_plane(
            src,
            &mut dst,
            plane_start + uv_offset,
            uv_width,
            crop_width.div_ceil(2),
            crop_height.div_ceil(2),
        );
    }

    dst
}
