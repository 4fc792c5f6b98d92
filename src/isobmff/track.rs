// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    boxes::{fourcc, parse_children, BoxTree, BoxType},
    codec,
    sample_table::{SampleTableError, SampleTables},
};
use byteio::{ByteIterator, ReadError};
use bytes::Bytes;
use common::{
    AspectRatio, AudioCodec, AudioTrack, ColorInfo, OtherTrack, Rotation, Track, TrackId,
    VideoCodec, VideoTrack,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("trak at offset {0} has no '{1}'")]
    MissingBox(u64, &'static str),

    #[error("box '{fourcc_}': {1}", fourcc_ = fourcc(*.0))]
    Malformed(BoxType, &'static str),

    #[error("sample table: {0}")]
    SampleTable(#[from] SampleTableError),
}

const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;
const AUDIO_SAMPLE_ENTRY_LEN: usize = 28;

pub(crate) struct ParsedTrak {
    pub track: Track,
    pub tables: SampleTables,
}

pub(crate) fn parse_trak(trak: &BoxTree) -> Result<ParsedTrak, TrackError> {
    let tkhd = trak
        .child(*b"tkhd")
        .ok_or(TrackError::MissingBox(trak.offset, "tkhd"))?;
    let tkhd = parse_tkhd(tkhd.payload)?;

    let mdia = trak
        .child(*b"mdia")
        .ok_or(TrackError::MissingBox(trak.offset, "mdia"))?;
    let mdhd = mdia
        .child(*b"mdhd")
        .ok_or(TrackError::MissingBox(trak.offset, "mdhd"))?;
    let timescale = parse_mdhd_timescale(mdhd.payload)?;
    let hdlr = mdia
        .child(*b"hdlr")
        .ok_or(TrackError::MissingBox(trak.offset, "hdlr"))?;
    let handler_type = parse_hdlr_type(hdlr.payload)?;

    let stbl = mdia
        .find(&[*b"minf", *b"stbl"])
        .ok_or(TrackError::MissingBox(trak.offset, "stbl"))?;
    let elst = trak.find(&[*b"edts", *b"elst"]);
    let tables = SampleTables::parse(stbl, elst)?;

    let id = TrackId::new(tkhd.track_id);
    let entry = first_sample_entry(stbl)?;

    let track = match (&handler_type, entry) {
        (b"vide", Some(entry)) => {
            match parse_video_entry(&entry, id, timescale, &tkhd)? {
                Some(v) => Track::Video(v),
                None => Track::Other(OtherTrack { id, timescale }),
            }
        }
        (b"soun", Some(entry)) => {
            match parse_audio_entry(&entry, id, timescale)? {
                Some(v) => Track::Audio(v),
                None => Track::Other(OtherTrack { id, timescale }),
            }
        }
        _ => Track::Other(OtherTrack { id, timescale }),
    };

    Ok(ParsedTrak { track, tables })
}

struct TkhdInfo {
    track_id: u32,
    width: u32,  // Integer part of the 16.16 value.
    height: u32,
    matrix: [i32; 9],
}

fn parse_tkhd(payload: &[u8]) -> Result<TkhdInfo, TrackError> {
    let typ = *b"tkhd";
    let trunc = |_: ReadError| TrackError::Malformed(typ, "truncated");
    let mut it = ByteIterator::new(payload, 0);
    let version = it.read_u8().map_err(trunc)?;
    it.skip(3).map_err(trunc)?;

    let track_id = if version == 1 {
        it.skip(16).map_err(trunc)?; // Creation and modification time.
        let id = it.read_u32().map_err(trunc)?;
        it.skip(4).map_err(trunc)?; // Reserved.
        it.skip(8).map_err(trunc)?; // Duration.
        id
    } else {
        it.skip(8).map_err(trunc)?;
        let id = it.read_u32().map_err(trunc)?;
        it.skip(4).map_err(trunc)?;
        it.skip(4).map_err(trunc)?;
        id
    };

    it.skip(8).map_err(trunc)?; // Reserved.
    it.skip(2).map_err(trunc)?; // Layer.
    it.skip(2).map_err(trunc)?; // Alternate group.
    it.skip(2).map_err(trunc)?; // Volume.
    it.skip(2).map_err(trunc)?; // Reserved.

    let mut matrix = [0_i32; 9];
    for v in &mut matrix {
        *v = it.read_i32().map_err(trunc)?;
    }
    let width = it.read_u32().map_err(trunc)? >> 16;
    let height = it.read_u32().map_err(trunc)? >> 16;

    Ok(TkhdInfo {
        track_id,
        width,
        height,
        matrix,
    })
}

// Only the four canonical rotation matrices are recognized,
// anything else maps to zero degrees.
pub(crate) fn rotation_from_matrix(matrix: &[i32; 9]) -> Rotation {
    const ONE: i32 = 0x0001_0000;
    match (matrix[0], matrix[1], matrix[3], matrix[4]) {
        (a, b, c, d) if a == 0 && b == ONE && c == -ONE && d == 0 => Rotation::R90,
        (a, b, c, d) if a == -ONE && b == 0 && c == 0 && d == -ONE => Rotation::R180,
        (a, b, c, d) if a == 0 && b == -ONE && c == ONE && d == 0 => Rotation::R270,
        _ => Rotation::R0,
    }
}

fn parse_mdhd_timescale(payload: &[u8]) -> Result<u32, TrackError> {
    let typ = *b"mdhd";
    let trunc = |_: ReadError| TrackError::Malformed(typ, "truncated");
    let mut it = ByteIterator::new(payload, 0);
    let version = it.read_u8().map_err(trunc)?;
    it.skip(3).map_err(trunc)?;
    if version == 1 {
        it.skip(16).map_err(trunc)?;
    } else {
        it.skip(8).map_err(trunc)?;
    }
    let timescale = it.read_u32().map_err(trunc)?;
    if timescale == 0 {
        return Err(TrackError::Malformed(typ, "zero timescale"));
    }
    Ok(timescale)
}

fn parse_hdlr_type(payload: &[u8]) -> Result<[u8; 4], TrackError> {
    let trunc = |_: ReadError| TrackError::Malformed(*b"hdlr", "truncated");
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).map_err(trunc)?; // Full box.
    it.skip(4).map_err(trunc)?; // Predefined.
    it.read_fourcc().map_err(trunc)
}

struct SampleEntry<'a> {
    typ: BoxType,
    payload: &'a [u8],
    offset: u64,
}

fn first_sample_entry<'a>(stbl: &BoxTree<'a>) -> Result<Option<SampleEntry<'a>>, TrackError> {
    let Some(stsd) = stbl.child(*b"stsd") else {
        return Ok(None);
    };
    let trunc = |_: ReadError| TrackError::Malformed(*b"stsd", "truncated");
    let mut it = ByteIterator::new(stsd.payload, 0);
    it.skip(4).map_err(trunc)?; // Full box.
    let entry_count = it.read_u32().map_err(trunc)?;
    if entry_count == 0 || stsd.payload.len() < 8 {
        return Ok(None);
    }

    // Sample entries are boxes themselves.
    let entries = parse_children(&stsd.payload[8..], stsd.offset + 16)
        .map_err(|_| TrackError::Malformed(*b"stsd", "bad sample entry"))?;
    Ok(entries.into_iter().next().map(|e| SampleEntry {
        typ: e.typ,
        payload: e.payload,
        offset: e.offset,
    }))
}

// Child boxes that follow the fixed sample entry fields.
fn entry_children<'a>(
    entry: &SampleEntry<'a>,
    fixed_len: usize,
) -> Result<Vec<BoxTree<'a>>, TrackError> {
    if entry.payload.len() < fixed_len {
        return Err(TrackError::Malformed(entry.typ, "entry too short"));
    }
    // The payload starts after the 8 byte box header.
    let base = entry.offset + 8 + u64::try_from(fixed_len).expect("u64 fit usize");
    parse_children(&entry.payload[fixed_len..], base)
        .map_err(|_| TrackError::Malformed(entry.typ, "bad entry children"))
}

fn parse_video_entry(
    entry: &SampleEntry,
    id: TrackId,
    timescale: u32,
    tkhd: &TkhdInfo,
) -> Result<Option<VideoTrack>, TrackError> {
    let codec = match &entry.typ {
        b"avc1" | b"avc3" => VideoCodec::H264,
        b"hev1" | b"hvc1" => VideoCodec::H265,
        b"vp08" => VideoCodec::Vp8,
        b"vp09" => VideoCodec::Vp9,
        b"av01" => VideoCodec::Av1,
        _ => return Ok(None),
    };

    let trunc = |_: ReadError| TrackError::Malformed(entry.typ, "truncated");
    let mut it = ByteIterator::new(entry.payload, 0);
    it.skip(8).map_err(trunc)?; // Reserved, data reference index.
    it.skip(16).map_err(trunc)?; // Predefined, reserved.
    let coded_width = u32::from(it.read_u16().map_err(trunc)?);
    let coded_height = u32::from(it.read_u16().map_err(trunc)?);

    let children = entry_children(entry, VISUAL_SAMPLE_ENTRY_LEN)?;
    let config = children.iter().find(|c| {
        matches!(&c.typ, b"avcC" | b"hvcC" | b"vpcC" | b"av1C")
    });

    let codec_string = match (codec, config) {
        (VideoCodec::H264, Some(c)) => codec::avc_codec_string(c.payload),
        (VideoCodec::H265, Some(c)) => codec::hevc_codec_string(c.payload),
        (VideoCodec::Vp8, _) => Some("vp8".to_owned()),
        (VideoCodec::Vp9, Some(c)) => codec::vp9_codec_string(c.payload),
        (VideoCodec::Av1, Some(c)) => codec::av1_codec_string(c.payload),
        _ => None,
    }
    .ok_or(TrackError::Malformed(entry.typ, "missing codec config"))?;

    let codec_private = config.map(|c| Bytes::copy_from_slice(c.payload));

    let sample_aspect_ratio = match children.iter().find(|c| c.typ == *b"pasp") {
        Some(pasp) => parse_pasp(pasp.payload)?,
        None => AspectRatio::default(),
    };
    let color = match children.iter().find(|c| c.typ == *b"colr") {
        Some(colr) => parse_colr(colr.payload),
        None => None,
    };

    // Display size comes from tkhd, falling back to the coded
    // size with the sample aspect applied.
    let (display_aspect_width, display_aspect_height) = if tkhd.width != 0 && tkhd.height != 0 {
        (tkhd.width, tkhd.height)
    } else {
        (
            coded_width * sample_aspect_ratio.num / sample_aspect_ratio.den.max(1),
            coded_height,
        )
    };

    Ok(Some(VideoTrack {
        id,
        timescale,
        codec,
        codec_string,
        coded_width,
        coded_height,
        display_aspect_width,
        display_aspect_height,
        rotation: rotation_from_matrix(&tkhd.matrix),
        sample_aspect_ratio,
        color,
        codec_private,
    }))
}

fn parse_audio_entry(
    entry: &SampleEntry,
    id: TrackId,
    timescale: u32,
) -> Result<Option<AudioTrack>, TrackError> {
    let trunc = |_: ReadError| TrackError::Malformed(entry.typ, "truncated");
    let mut it = ByteIterator::new(entry.payload, 0);
    it.skip(8).map_err(trunc)?; // Reserved, data reference index.
    it.skip(8).map_err(trunc)?; // Entry version, reserved.
    let channels = u32::from(it.read_u16().map_err(trunc)?);
    it.skip(2).map_err(trunc)?; // Sample size.
    it.skip(4).map_err(trunc)?; // Predefined, reserved.
    let sample_rate = it.read_u32().map_err(trunc)? >> 16;

    match &entry.typ {
        b"mp4a" => {
            let children = entry_children(entry, AUDIO_SAMPLE_ENTRY_LEN)?;
            let esds = children
                .iter()
                .find(|c| c.typ == *b"esds")
                .ok_or(TrackError::Malformed(entry.typ, "missing esds"))?;
            let (object_type, asc) = parse_esds(esds.payload)
                .ok_or(TrackError::Malformed(*b"esds", "bad descriptor"))?;

            let codec = match object_type {
                0x40 | 0x66 | 0x67 | 0x68 => AudioCodec::Aac,
                0x69 | 0x6B => AudioCodec::Mp3,
                _ => return Ok(None),
            };
            let codec_string = match codec {
                AudioCodec::Aac => codec::aac_codec_string(&asc),
                _ => "mp3".to_owned(),
            };
            Ok(Some(AudioTrack {
                id,
                timescale,
                codec,
                codec_string,
                number_of_channels: channels,
                sample_rate,
                codec_private: (!asc.is_empty()).then(|| Bytes::from(asc)),
            }))
        }
        b"Opus" | b"opus" => {
            let children = entry_children(entry, AUDIO_SAMPLE_ENTRY_LEN)?;
            let dops = children.iter().find(|c| c.typ == *b"dOps");
            Ok(Some(AudioTrack {
                id,
                timescale,
                codec: AudioCodec::Opus,
                codec_string: "opus".to_owned(),
                number_of_channels: channels,
                sample_rate,
                codec_private: dops.map(|c| Bytes::copy_from_slice(c.payload)),
            }))
        }
        b"lpcm" | b"sowt" | b"twos" => Ok(Some(AudioTrack {
            id,
            timescale,
            codec: AudioCodec::Pcm,
            codec_string: "pcm".to_owned(),
            number_of_channels: channels,
            sample_rate,
            codec_private: None,
        })),
        _ => Ok(None),
    }
}

fn parse_pasp(payload: &[u8]) -> Result<AspectRatio, TrackError> {
    let trunc = |_: ReadError| TrackError::Malformed(*b"pasp", "truncated");
    let mut it = ByteIterator::new(payload, 0);
    let num = it.read_u32().map_err(trunc)?;
    let den = it.read_u32().map_err(trunc)?;
    if num == 0 || den == 0 {
        return Ok(AspectRatio::default());
    }
    Ok(AspectRatio { num, den })
}

fn parse_colr(payload: &[u8]) -> Option<ColorInfo> {
    let mut it = ByteIterator::new(payload, 0);
    let kind = it.read_fourcc().ok()?;
    if &kind != b"nclx" && &kind != b"nclc" {
        return None;
    }
    let primaries = u8::try_from(it.read_u16().ok()?).ok()?;
    let transfer = u8::try_from(it.read_u16().ok()?).ok()?;
    let matrix = u8::try_from(it.read_u16().ok()?).ok()?;
    let full_range = if &kind == b"nclx" {
        it.read_u8().ok()? >> 7 == 1
    } else {
        false
    };
    Some(ColorInfo {
        primaries,
        transfer,
        matrix,
        full_range,
    })
}

// Walks the esds descriptor chain and returns the object type
// indication and the AudioSpecificConfig bytes.
fn parse_esds(payload: &[u8]) -> Option<(u8, Vec<u8>)> {
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).ok()?; // Full box.

    let (tag, _) = read_descriptor(&mut it)?;
    if tag != 0x03 {
        return None;
    }
    it.skip(2).ok()?; // ES ID.
    let flags = it.read_u8().ok()?;
    if flags & 0x80 != 0 {
        it.skip(2).ok()?; // Depends on ES ID.
    }
    if flags & 0x40 != 0 {
        let url_len = it.read_u8().ok()?;
        it.skip(usize::from(url_len)).ok()?;
    }
    if flags & 0x20 != 0 {
        it.skip(2).ok()?; // OCR ES ID.
    }

    let (tag, _) = read_descriptor(&mut it)?;
    if tag != 0x04 {
        return None;
    }
    let object_type = it.read_u8().ok()?;
    it.skip(12).ok()?; // Stream type, buffer size, bitrates.

    let (tag, size) = read_descriptor(&mut it)?;
    if tag != 0x05 {
        return Some((object_type, Vec::new()));
    }
    let asc = it.read_bytes(size).ok()?;
    Some((object_type, asc.to_vec()))
}

// Descriptor header: tag byte plus a base-128 length.
fn read_descriptor(it: &mut ByteIterator) -> Option<(u8, usize)> {
    let tag = it.read_u8().ok()?;
    let mut size: usize = 0;
    for _ in 0..4 {
        let b = it.read_u8().ok()?;
        size = (size << 7) | usize::from(b & 0x7F);
        if b & 0x80 == 0 {
            break;
        }
    }
    Some((tag, size))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const ONE: i32 = 0x0001_0000;

    #[test_case([ONE, 0, 0, 0, ONE, 0, 0, 0, 0x4000_0000], Rotation::R0; "identity")]
    #[test_case([0, ONE, 0, -ONE, 0, 0, 0, 500 * ONE, 0x4000_0000], Rotation::R90; "ninety")]
    #[test_case([-ONE, 0, 0, 0, -ONE, 0, 0, 0, 0x4000_0000], Rotation::R180; "one eighty")]
    #[test_case([0, -ONE, 0, ONE, 0, 0, 0, 0, 0x4000_0000], Rotation::R270; "two seventy")]
    #[test_case([ONE, 1, 0, 0, ONE, 0, 0, 0, 0x4000_0000], Rotation::R0; "unrecognized")]
    fn test_rotation_from_matrix(matrix: [i32; 9], want: Rotation) {
        assert_eq!(want, rotation_from_matrix(&matrix));
    }

    #[test]
    fn test_parse_esds() {
        let payload = [
            0, 0, 0, 0, // Full box.
            3, 0x19, // ES descriptor.
            0, 1, // ES ID.
            0, // Flags.
            4, 0x11, // Decoder config descriptor.
            0x40, // Object type.
            0x15, // Stream type.
            0, 0, 0, // Buffer size.
            0, 1, 0xf4, 0, // Max bitrate.
            0, 1, 0xf4, 0, // Average bitrate.
            5, 2, // Decoder specific info.
            0x12, 0x10, // AudioSpecificConfig.
            6, 1, 2, // SL config.
        ];
        let (object_type, asc) = parse_esds(&payload).unwrap();
        assert_eq!(0x40, object_type);
        assert_eq!(vec![0x12, 0x10], asc);
    }

    #[test]
    fn test_parse_esds_extended_length() {
        // Length bytes with continuation bit set, as some muxers emit.
        let payload = [
            0, 0, 0, 0, //
            3, 0x80, 0x80, 0x80, 0x19, //
            0, 1, 0, //
            4, 0x80, 0x80, 0x80, 0x11, //
            0x40, 0x15, 0, 0, 0, //
            0, 1, 0xf4, 0, //
            0, 1, 0xf4, 0, //
            5, 0x80, 0x80, 0x80, 2, //
            0x12, 0x10, //
        ];
        let (object_type, asc) = parse_esds(&payload).unwrap();
        assert_eq!(0x40, object_type);
        assert_eq!(vec![0x12, 0x10], asc);
    }
}
