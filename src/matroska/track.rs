// SPDX-License-Identifier: GPL-2.0-or-later

use crate::element;
use byteio::{ByteIterator, ReadError};
use bytes::Bytes;
use common::{
    AspectRatio, AudioCodec, AudioTrack, ColorInfo, OtherTrack, Rotation, Track, TrackId,
    VideoCodec, VideoTrack,
};
use thiserror::Error;

// Matroska timestamps are normalized to microseconds, so every
// track is presented with a microsecond timescale.
pub const TRACK_TIMESCALE: u32 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("track entry at offset {0} is truncated")]
    Truncated(u64),

    #[error("track entry at offset {0} has no track number")]
    MissingNumber(u64),
}

pub(crate) struct ParsedEntry {
    pub track: Track,
    pub track_number: u64,
    pub default_duration_ns: Option<u64>,
}

// Walks a buffered Tracks payload and maps every TrackEntry.
pub(crate) fn parse_tracks(payload: &[u8], base: u64) -> Result<Vec<ParsedEntry>, TrackError> {
    let mut entries = Vec::new();
    let mut it = ByteIterator::new(payload, base);
    while !it.is_empty() {
        let offset = it.pos();
        let (id, payload) = read_child(&mut it).map_err(|_| TrackError::Truncated(offset))?;
        if id == element::TRACK_ENTRY {
            entries.push(parse_entry(payload, offset)?);
        }
    }
    Ok(entries)
}

fn read_child<'a>(it: &mut ByteIterator<'a>) -> Result<(u32, &'a [u8]), ReadError> {
    let id = it.read_element_id()?;
    let size = it.read_element_size()?;
    let size = usize::try_from(size).map_err(|_| ReadError::Incomplete)?;
    Ok((id, it.read_bytes(size)?))
}

#[derive(Default)]
struct EntryFields {
    number: Option<u64>,
    track_type: u64,
    codec_id: String,
    codec_private: Option<Bytes>,
    default_duration_ns: Option<u64>,

    pixel_width: u32,
    pixel_height: u32,
    display_width: u32,
    display_height: u32,
    color: Option<ColorInfo>,

    channels: u32,
    sampling_frequency: f64,
}

fn parse_entry(payload: &[u8], offset: u64) -> Result<ParsedEntry, TrackError> {
    let mut fields = EntryFields {
        channels: 1,
        sampling_frequency: 8000.0,
        ..Default::default()
    };

    let mut it = ByteIterator::new(payload, offset);
    while !it.is_empty() {
        let (id, data) = read_child(&mut it).map_err(|_| TrackError::Truncated(offset))?;
        let mut data_it = ByteIterator::new(data, 0);
        match id {
            element::TRACK_NUMBER => {
                fields.number = data_it.read_uint(data.len()).ok();
            }
            element::TRACK_TYPE => {
                fields.track_type = data_it.read_uint(data.len()).unwrap_or(0);
            }
            element::CODEC_ID => {
                fields.codec_id = data_it.read_string(data.len()).unwrap_or_default();
            }
            element::CODEC_PRIVATE => {
                fields.codec_private = Some(Bytes::copy_from_slice(data));
            }
            element::DEFAULT_DURATION => {
                fields.default_duration_ns = data_it.read_uint(data.len()).ok();
            }
            element::VIDEO => parse_video_fields(data, &mut fields),
            element::AUDIO => parse_audio_fields(data, &mut fields),
            // TrackUID, FlagDefault, FlagLacing, Language and
            // MaxBlockAdditionID carry nothing the pipeline needs.
            _ => {}
        }
    }

    let number = fields.number.ok_or(TrackError::MissingNumber(offset))?;
    let id = TrackId::new(u32::try_from(number).unwrap_or(u32::MAX));

    let track = make_track(id, &fields);
    Ok(ParsedEntry {
        track,
        track_number: number,
        default_duration_ns: fields.default_duration_ns,
    })
}

fn parse_video_fields(payload: &[u8], fields: &mut EntryFields) {
    let mut it = ByteIterator::new(payload, 0);
    while !it.is_empty() {
        let Ok((id, data)) = read_child(&mut it) else {
            return;
        };
        let mut data_it = ByteIterator::new(data, 0);
        let uint = |it: &mut ByteIterator| {
            u32::try_from(it.read_uint(data.len()).unwrap_or(0)).unwrap_or(0)
        };
        match id {
            element::PIXEL_WIDTH => fields.pixel_width = uint(&mut data_it),
            element::PIXEL_HEIGHT => fields.pixel_height = uint(&mut data_it),
            element::DISPLAY_WIDTH => fields.display_width = uint(&mut data_it),
            element::DISPLAY_HEIGHT => fields.display_height = uint(&mut data_it),
            element::COLOUR => fields.color = parse_colour(data),
            _ => {}
        }
    }
}

fn parse_colour(payload: &[u8]) -> Option<ColorInfo> {
    let mut color = ColorInfo {
        primaries: 2, // Unspecified.
        transfer: 2,
        matrix: 2,
        full_range: false,
    };
    let mut it = ByteIterator::new(payload, 0);
    while !it.is_empty() {
        let (id, data) = read_child(&mut it).ok()?;
        let mut data_it = ByteIterator::new(data, 0);
        let value = data_it.read_uint(data.len()).unwrap_or(0);
        let byte = u8::try_from(value).unwrap_or(0);
        match id {
            element::PRIMARIES => color.primaries = byte,
            element::TRANSFER_CHARACTERISTICS => color.transfer = byte,
            element::MATRIX_COEFFICIENTS => color.matrix = byte,
            element::RANGE => color.full_range = value == 2,
            _ => {}
        }
    }
    Some(color)
}

fn parse_audio_fields(payload: &[u8], fields: &mut EntryFields) {
    let mut it = ByteIterator::new(payload, 0);
    while !it.is_empty() {
        let Ok((id, data)) = read_child(&mut it) else {
            return;
        };
        let mut data_it = ByteIterator::new(data, 0);
        match id {
            element::CHANNELS => {
                fields.channels =
                    u32::try_from(data_it.read_uint(data.len()).unwrap_or(1)).unwrap_or(1);
            }
            element::SAMPLING_FREQUENCY => {
                fields.sampling_frequency = data_it.read_float(data.len()).unwrap_or(8000.0);
            }
            _ => {}
        }
    }
}

fn make_track(id: TrackId, fields: &EntryFields) -> Track {
    if let Some(codec) = video_codec(&fields.codec_id) {
        let codec_string = video_codec_string(codec, fields.codec_private.as_deref());
        let display_width = if fields.display_width != 0 {
            fields.display_width
        } else {
            fields.pixel_width
        };
        let display_height = if fields.display_height != 0 {
            fields.display_height
        } else {
            fields.pixel_height
        };
        return Track::Video(VideoTrack {
            id,
            timescale: TRACK_TIMESCALE,
            codec,
            codec_string,
            coded_width: fields.pixel_width,
            coded_height: fields.pixel_height,
            display_aspect_width: display_width,
            display_aspect_height: display_height,
            rotation: Rotation::R0,
            sample_aspect_ratio: AspectRatio::default(),
            color: fields.color,
            codec_private: fields.codec_private.clone(),
        });
    }

    if let Some(codec) = audio_codec(&fields.codec_id) {
        let codec_string = match codec {
            AudioCodec::Aac => isobmff::aac_codec_string(
                fields.codec_private.as_deref().unwrap_or_default(),
            ),
            AudioCodec::Opus => "opus".to_owned(),
            AudioCodec::Pcm => "pcm".to_owned(),
            AudioCodec::Mp3 => "mp3".to_owned(),
        };
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::as_conversions
        )]
        let sample_rate = fields.sampling_frequency as u32;
        return Track::Audio(AudioTrack {
            id,
            timescale: TRACK_TIMESCALE,
            codec,
            codec_string,
            number_of_channels: fields.channels,
            sample_rate,
            codec_private: fields.codec_private.clone(),
        });
    }

    Track::Other(OtherTrack {
        id,
        timescale: TRACK_TIMESCALE,
    })
}

fn video_codec(codec_id: &str) -> Option<VideoCodec> {
    match codec_id {
        "V_VP8" => Some(VideoCodec::Vp8),
        "V_VP9" => Some(VideoCodec::Vp9),
        "V_AV1" => Some(VideoCodec::Av1),
        "V_MPEG4/ISO/AVC" => Some(VideoCodec::H264),
        "V_MPEGH/ISO/HEVC" => Some(VideoCodec::H265),
        _ => None,
    }
}

fn audio_codec(codec_id: &str) -> Option<AudioCodec> {
    if codec_id.starts_with("A_AAC") {
        return Some(AudioCodec::Aac);
    }
    match codec_id {
        "A_OPUS" => Some(AudioCodec::Opus),
        "A_PCM/INT/LIT" => Some(AudioCodec::Pcm),
        "A_MPEG/L3" => Some(AudioCodec::Mp3),
        _ => None,
    }
}

// The codec string follows the same assembly rules as for
// ISO-BMFF, sourced from CodecPrivate where one is carried.
fn video_codec_string(codec: VideoCodec, private: Option<&[u8]>) -> String {
    match (codec, private) {
        (VideoCodec::H264, Some(p)) => {
            isobmff::avc_codec_string(p).unwrap_or_else(|| "avc1".to_owned())
        }
        (VideoCodec::H264, None) => "avc1".to_owned(),
        (VideoCodec::H265, Some(p)) => {
            isobmff::hevc_codec_string(p).unwrap_or_else(|| "hvc1".to_owned())
        }
        (VideoCodec::H265, None) => "hvc1".to_owned(),
        (VideoCodec::Vp8, _) => "vp8".to_owned(),
        (VideoCodec::Vp9, _) => "vp09.00.10.08".to_owned(),
        (VideoCodec::Av1, Some(p)) => {
            isobmff::av1_codec_string(p).unwrap_or_else(|| "av01".to_owned())
        }
        (VideoCodec::Av1, None) => "av01".to_owned(),
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("V_VP8", Some(VideoCodec::Vp8); "vp8")]
    #[test_case("V_MPEG4/ISO/AVC", Some(VideoCodec::H264); "avc")]
    #[test_case("V_MS/VFW/FOURCC", None; "vfw")]
    fn test_video_codec(id: &str, want: Option<VideoCodec>) {
        assert_eq!(want, video_codec(id));
    }

    #[test_case("A_OPUS", Some(AudioCodec::Opus); "opus")]
    #[test_case("A_AAC", Some(AudioCodec::Aac); "aac")]
    #[test_case("A_AAC/MPEG4/LC", Some(AudioCodec::Aac); "aac lc")]
    #[test_case("A_PCM/INT/LIT", Some(AudioCodec::Pcm); "pcm")]
    #[test_case("A_MPEG/L3", Some(AudioCodec::Mp3); "mp3")]
    #[test_case("A_VORBIS", None; "vorbis")]
    fn test_audio_codec(id: &str, want: Option<AudioCodec>) {
        assert_eq!(want, audio_codec(id));
    }
}
