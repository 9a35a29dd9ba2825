// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

pub const PAGE_SIZE: usize = 4096;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to the previous multiple of `alignment`, which must be a power of two.
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

pub const fn page_align(value: usize) -> usize {
    align_up(value, PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(1080, 16), 1088);
        assert_eq!(align_up(1080, 32), 1088);
        assert_eq!(align_up(1090, 32), 1120);
        assert_eq!(align_down(0x3ffff, 512), 0x3fe00);
        assert_eq!(page_align(4097), 8192);
    }
}
