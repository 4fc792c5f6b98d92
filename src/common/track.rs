// SPDX-License-Identifier: GPL-2.0-or-later

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ops::Deref;

// Container-unique track identifier.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TrackId(u32);

impl TrackId {
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }
}

impl From<u32> for TrackId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl Deref for TrackId {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
}

impl VideoCodec {
    // Name used in configuration and log output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Vp8 => "vp8",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Pcm,
    Mp3,
}

impl AudioCodec {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "opus",
            AudioCodec::Pcm => "pcm",
            AudioCodec::Mp3 => "mp3",
        }
    }
}

impl std::fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Clockwise display rotation derived from the track matrix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    #[must_use]
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AspectRatio {
    pub num: u32,
    pub den: u32,
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self { num: 1, den: 1 }
    }
}

// Color description carried through from the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorInfo {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub full_range: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoTrack {
    pub id: TrackId,

    // Ticks per second for sample timestamps.
    pub timescale: u32,

    pub codec: VideoCodec,

    // RFC 6381 string, e.g. "avc1.640016".
    pub codec_string: String,

    pub coded_width: u32,
    pub coded_height: u32,
    pub display_aspect_width: u32,
    pub display_aspect_height: u32,
    pub rotation: Rotation,
    pub sample_aspect_ratio: AspectRatio,
    pub color: Option<ColorInfo>,

    // Decoder initialization bytes (AVCC record, vpcC payload, ...).
    pub codec_private: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioTrack {
    pub id: TrackId,
    pub timescale: u32,
    pub codec: AudioCodec,
    pub codec_string: String,
    pub number_of_channels: u32,
    pub sample_rate: u32,
    pub codec_private: Option<Bytes>,
}

// A track the pipeline cannot process but must not choke on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtherTrack {
    pub id: TrackId,
    pub timescale: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Track {
    Video(VideoTrack),
    Audio(AudioTrack),
    Other(OtherTrack),
}

impl Track {
    #[must_use]
    pub fn id(&self) -> TrackId {
        match self {
            Track::Video(v) => v.id,
            Track::Audio(v) => v.id,
            Track::Other(v) => v.id,
        }
    }

    #[must_use]
    pub fn timescale(&self) -> u32 {
        match self {
            Track::Video(v) => v.timescale,
            Track::Audio(v) => v.timescale,
            Track::Other(v) => v.timescale,
        }
    }
}
