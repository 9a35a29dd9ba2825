// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interpretation of the MPEG-4 part 2 profile and level reported by the decoder.

/// Visual object type the stream conforms to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Profile {
    Simple,
    AdvancedCodingEfficiency,
    AdvancedSimple,
    Reserved,
}

/// Level reported when only a VOL header was found.
pub const UNKNOWN_LEVEL: u32 = 7;

const VOS_HEADER_FLAG: u32 = 0x80;

/// Maps the raw `profile` and `level` values reported by the decoder to an MPEG-4 profile and
/// level. Bit 7 of `level` tells whether a VOS header was present, in which case `profile` is a
/// `profile_and_level_indication`. Otherwise `profile` is the `video_object_type_indication` of
/// the VOL header and the level is unknown.
pub fn profile_and_level(profile: u32, level: u32) -> (Profile, u32) {
    if level & VOS_HEADER_FLAG != 0 {
        let level = level & 0x7f;
        if level == 8 && profile == 0 {
            // Simple profile, level 0.
            return (Profile::Simple, 0);
        }

        let profile = match profile {
            0x0 => Profile::Simple,
            0xb => Profile::AdvancedCodingEfficiency,
            0xf if level & 8 == 0 => Profile::AdvancedSimple,
            _ => Profile::Reserved,
        };

        (profile, level)
    } else {
        let profile = match profile {
            0x1 => Profile::Simple,
            0xc => Profile::AdvancedCodingEfficiency,
            0x11 => Profile::AdvancedSimple,
            _ => Profile::Reserved,
        };

        (profile, UNKNOWN_LEVEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vos_header() {
        assert_eq!(profile_and_level(0, 0x88), (Profile::Simple, 0));
        assert_eq!(profile_and_level(0, 0x83), (Profile::Simple, 3));
        assert_eq!(
            profile_and_level(0xb, 0x82),
            (Profile::AdvancedCodingEfficiency, 2)
        );
        assert_eq!(profile_and_level(0xf, 0x85), (Profile::AdvancedSimple, 5));
        assert_eq!(profile_and_level(0xf, 0x8a), (Profile::Reserved, 10));
    }

    #[test]
    fn vol_header_only() {
        assert_eq!(profile_and_level(0x11, 3), (Profile::AdvancedSimple, 7));
        assert_eq!(profile_and_level(0x1, 0), (Profile::Simple, 7));
        assert_eq!(profile_and_level(0x42, 0), (Profile::Reserved, 7));
    }
}
