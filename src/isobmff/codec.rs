// SPDX-License-Identifier: GPL-2.0-or-later

// RFC 6381 codec string assembly from decoder configuration records.

use byteio::ByteIterator;

// "avc1.PPCCLL" from the first bytes of the AVCC record.
#[must_use]
pub fn avc_codec_string(avcc: &[u8]) -> Option<String> {
    if avcc.len() < 4 {
        return None;
    }
    Some(format!("avc1.{:02X}{:02X}{:02X}", avcc[1], avcc[2], avcc[3]))
}

// "hvc1.<space><profile>.<compat>.<tier><level>.<constraints>" from hvcC.
#[must_use]
pub fn hevc_codec_string(hvcc: &[u8]) -> Option<String> {
    let mut it = ByteIterator::new(hvcc, 0);
    it.read_u8().ok()?; // Configuration version.
    let b = it.read_u8().ok()?;
    let profile_space = b >> 6;
    let tier = (b >> 5) & 1;
    let profile_idc = b & 0b0001_1111;
    let compat = it.read_u32().ok()?;
    let constraints = it.read_bytes(6).ok()?;
    let level_idc = it.read_u8().ok()?;

    let space = match profile_space {
        1 => "A",
        2 => "B",
        3 => "C",
        _ => "",
    };
    // Compatibility flags are serialized bit-reversed.
    let compat = compat.reverse_bits();
    let tier = if tier == 0 { "L" } else { "H" };

    let mut out = format!("hvc1.{space}{profile_idc}.{compat:X}.{tier}{level_idc}");
    // Trailing zero constraint bytes are omitted.
    let trimmed: &[u8] = {
        let mut end = constraints.len();
        while end > 0 && constraints[end - 1] == 0 {
            end -= 1;
        }
        &constraints[..end]
    };
    for b in trimmed {
        out.push_str(&format!(".{b:X}"));
    }
    Some(out)
}

// "mp4a.40.X" where X is the audio object type from the
// AudioSpecificConfig, falling back to AAC-LC.
#[must_use]
pub fn aac_codec_string(audio_specific_config: &[u8]) -> String {
    let object_type = audio_specific_config
        .first()
        .map_or(2, |first| first >> 3);
    format!("mp4a.40.{object_type}")
}

// "vp09.PP.LL.DD" from the vpcC payload (after the full box header).
#[must_use]
pub fn vp9_codec_string(vpcc: &[u8]) -> Option<String> {
    let mut it = ByteIterator::new(vpcc, 0);
    it.skip(4).ok()?; // Full box.
    let profile = it.read_u8().ok()?;
    let level = it.read_u8().ok()?;
    let bit_depth = it.read_u8().ok()? >> 4;
    Some(format!("vp09.{profile:02}.{level:02}.{bit_depth:02}"))
}

// "av01.P.LLT.DD" from the av1C payload.
#[must_use]
pub fn av1_codec_string(av1c: &[u8]) -> Option<String> {
    let mut it = ByteIterator::new(av1c, 0);
    it.read_u8().ok()?; // Marker and version.
    let b = it.read_u8().ok()?;
    let profile = b >> 5;
    let level = b & 0b0001_1111;
    let b = it.read_u8().ok()?;
    let tier = if b >> 7 == 0 { "M" } else { "H" };
    let high_bitdepth = (b >> 6) & 1;
    let twelve_bit = (b >> 5) & 1;
    let bit_depth = match (high_bitdepth, twelve_bit) {
        (1, 1) => 12,
        (1, 0) => 10,
        _ => 8,
    };
    Some(format!("av01.{profile}.{level:02}{tier}.{bit_depth:02}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_avc() {
        // High profile, level 2.2.
        let avcc = [1, 0x64, 0x00, 0x16, 0xFF];
        assert_eq!(Some("avc1.640016".to_owned()), avc_codec_string(&avcc));
        assert_eq!(None, avc_codec_string(&[1, 2]));
    }

    #[test]
    fn test_hevc() {
        // Main profile (idc 1, compat 0x60000000), main tier level 93.
        let hvcc = [
            1,    // Configuration version.
            0x01, // Space 0, tier L, profile 1.
            0x60, 0, 0, 0, // Compatibility.
            0x90, 0, 0, 0, 0, 0, // Constraints.
            0x5D, // Level 93.
        ];
        assert_eq!(
            Some("hvc1.1.6.L93.90".to_owned()),
            hevc_codec_string(&hvcc)
        );
    }

    #[test_case(&[0x12, 0x10], "mp4a.40.2"; "aac lc")]
    #[test_case(&[0x2B, 0x92, 8, 0], "mp4a.40.5"; "he aac")]
    #[test_case(&[], "mp4a.40.2"; "missing config")]
    fn test_aac(asc: &[u8], want: &str) {
        assert_eq!(want, aac_codec_string(asc));
    }

    #[test]
    fn test_vp9() {
        let vpcc = [
            1, 0, 0, 0, // Full box.
            0,    // Profile.
            10,   // Level 1.0.
            0x80, // Bit depth 8, colour bits.
            2, 2, 2, 0, // Colour description.
            0, 0, // Codec initialization data size.
        ];
        assert_eq!(Some("vp09.00.10.08".to_owned()), vp9_codec_string(&vpcc));
    }

    #[test]
    fn test_av1() {
        let av1c = [
            0x81, // Marker, version 1.
            0x08, // Profile 0, level 8 (4.0).
            0x00, // Main tier, 8-bit.
            0,
        ];
        assert_eq!(Some("av01.0.08M.08".to_owned()), av1_codec_string(&av1c));
    }
}
