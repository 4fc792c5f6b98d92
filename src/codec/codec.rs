// SPDX-License-Identifier: GPL-2.0-or-later

mod stage;

pub use stage::{
    AudioStage, StageError, VideoStage, AUDIO_IN_FLIGHT_LIMIT, VIDEO_IN_FLIGHT_LIMIT,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    time::{DurationMicros, Micros},
    DynError, EncodedChunk,
};
use serde::Deserialize;

// Encoder tuning requested by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyMode {
    Realtime,

    #[default]
    Quality,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoDecoderConfig {
    // RFC 6381 string, e.g. "avc1.640016".
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,

    // Codec-private initialization bytes.
    pub description: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoEncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
    pub framerate: f64,
    pub latency_mode: LatencyMode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioDecoderConfig {
    pub codec: String,
    pub number_of_channels: u32,
    pub sample_rate: u32,
    pub description: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioEncoderConfig {
    pub codec: String,
    pub number_of_channels: u32,
    pub sample_rate: u32,
    pub bitrate: u64,
}

// Decoded picture. Dropping the frame releases it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoFrame {
    pub timestamp: Micros,
    pub duration: Option<DurationMicros>,
    pub coded_width: u32,
    pub coded_height: u32,
    pub data: Bytes,
}

// Decoded PCM audio buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFrame {
    pub timestamp: Micros,
    pub number_of_frames: u32,
    pub number_of_channels: u32,
    pub sample_rate: u32,
    pub data: Bytes,
}

#[async_trait]
pub trait VideoFrameSink: Send + Sync {
    async fn frame(&self, frame: VideoFrame) -> Result<(), DynError>;
}

pub type DynVideoFrameSink = Box<dyn VideoFrameSink>;

#[async_trait]
pub trait AudioFrameSink: Send + Sync {
    async fn frame(&self, frame: AudioFrame) -> Result<(), DynError>;
}

pub type DynAudioFrameSink = Box<dyn AudioFrameSink>;

#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn chunk(&self, chunk: EncodedChunk) -> Result<(), DynError>;
}

pub type DynChunkSink = Box<dyn ChunkSink>;

// Platform decoder handle. Frames surface through the sink the
// factory received, errors through the returned results.
#[async_trait]
pub trait VideoDecoder: Send {
    async fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DynError>;

    // Resolves after every submitted chunk has produced its frames.
    async fn flush(&mut self) -> Result<(), DynError>;

    async fn close(&mut self);
}

pub type DynVideoDecoder = Box<dyn VideoDecoder>;

pub trait VideoDecoderFactory: Send + Sync {
    fn open(
        &self,
        config: &VideoDecoderConfig,
        sink: DynVideoFrameSink,
    ) -> Result<DynVideoDecoder, DynError>;
}

#[async_trait]
pub trait VideoEncoder: Send {
    async fn encode(&mut self, frame: VideoFrame, key_request: bool) -> Result<(), DynError>;

    async fn flush(&mut self) -> Result<(), DynError>;

    async fn close(&mut self);
}

pub type DynVideoEncoder = Box<dyn VideoEncoder>;

pub trait VideoEncoderFactory: Send + Sync {
    fn open(
        &self,
        config: &VideoEncoderConfig,
        sink: DynChunkSink,
    ) -> Result<DynVideoEncoder, DynError>;
}

#[async_trait]
pub trait AudioDecoder: Send {
    async fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DynError>;

    async fn flush(&mut self) -> Result<(), DynError>;

    async fn close(&mut self);
}

pub type DynAudioDecoder = Box<dyn AudioDecoder>;

pub trait AudioDecoderFactory: Send + Sync {
    fn open(
        &self,
        config: &AudioDecoderConfig,
        sink: DynAudioFrameSink,
    ) -> Result<DynAudioDecoder, DynError>;
}

#[async_trait]
pub trait AudioEncoder: Send {
    async fn encode(&mut self, frame: AudioFrame) -> Result<(), DynError>;

    async fn flush(&mut self) -> Result<(), DynError>;

    async fn close(&mut self);
}

pub type DynAudioEncoder = Box<dyn AudioEncoder>;

pub trait AudioEncoderFactory: Send + Sync {
    fn open(
        &self,
        config: &AudioEncoderConfig,
        sink: DynChunkSink,
    ) -> Result<DynAudioEncoder, DynError>;
}

// User hook between decoder and encoder.
pub type VideoFrameHook = Box<dyn Fn(VideoFrame) -> Result<VideoFrame, DynError> + Send + Sync>;
