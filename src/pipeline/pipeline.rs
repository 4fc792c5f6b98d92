// SPDX-License-Identifier: GPL-2.0-or-later

#[cfg(test)]
mod test;

use async_trait::async_trait;
use bytes::Bytes;
use bytesize::ByteSize;
use codec::{
    AudioDecoderConfig, AudioDecoderFactory, AudioEncoderConfig, AudioEncoderFactory, AudioStage,
    ChunkSink, LatencyMode, StageError, VideoDecoderConfig, VideoDecoderFactory,
    VideoEncoderConfig, VideoEncoderFactory, VideoFrameHook, VideoStage,
};
use common::{
    time::DurationMicros, ArcLogger, AudioCodec, AudioTrack, ContainerFormat, DemuxEvent,
    DynError, DynSourceReader, EncodedChunk, LogEntry, LogLevel, SamplePosition,
    SharedMemoryWriter, Track, TrackId, VideoCodec, VideoTrack,
};
use mp4_muxer::{MoovPlacement, Mp4Muxer, Mp4MuxerError, Mp4MuxerOptions};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use webm_muxer::{WebmMuxer, WebmMuxerError, WebmMuxerOptions, WebmTrack};

const LOG_SOURCE: &str = "pipeline";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unsupported config: {option} = '{value}'")]
    UnsupportedConfig {
        option: &'static str,
        value: String,
    },

    #[error("unsupported codec '{codec}' for {context}")]
    UnsupportedCodec {
        codec: String,
        context: &'static str,
    },

    #[error("unrecognized container signature")]
    UnknownContainer,

    #[error("malformed {format} container: {source}")]
    MalformedContainer {
        format: ContainerFormat,
        source: DynError,
    },

    #[error("codec failure on track {track}: {source}")]
    CodecFailure { track: TrackId, source: StageError },

    #[error("mux: {0}")]
    Mux(DynError),

    #[error("read: {0}")]
    Read(DynError),

    #[error("aborted")]
    Aborted,
}

// Conversion progress snapshot. Observers may see coalesced
// updates, never out-of-order ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub decoded_video: u64,
    pub decoded_audio: u64,
    pub encoded_video: u64,
    pub encoded_audio: u64,
    pub duration_micros: DurationMicros,
}

pub type ProgressFn = Box<dyn Fn(Progress) + Send + Sync>;

// Platform codec factories. Only the transcode path needs them,
// pure copy conversions may leave them all unset.
#[derive(Default)]
pub struct CodecFactories {
    pub video_decoder: Option<Box<dyn VideoDecoderFactory>>,
    pub video_encoder: Option<Box<dyn VideoEncoderFactory>>,
    pub audio_decoder: Option<Box<dyn AudioDecoderFactory>>,
    pub audio_encoder: Option<Box<dyn AudioEncoderFactory>>,
}

pub struct ConvertOptions {
    // The mp4 output path is scoped but still gated.
    pub allow_mp4_output: bool,

    // Source read granularity while demuxing.
    pub read_size: ByteSize,

    pub moov_placement: MoovPlacement,
    pub write_cues: bool,

    pub video_bitrate: u64,
    pub audio_bitrate: u64,
    pub framerate: f64,
    pub latency_mode: LatencyMode,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            allow_mp4_output: false,
            read_size: ByteSize::kib(256),
            moov_placement: MoovPlacement::default(),
            write_cues: false,
            video_bitrate: 1_000_000,
            audio_bitrate: 128_000,
            framerate: 30.0,
            latency_mode: LatencyMode::Quality,
        }
    }
}

pub struct ConvertRequest {
    pub reader: DynSourceReader,
    pub to: ContainerFormat,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub codecs: CodecFactories,
    pub on_video_frame: Option<VideoFrameHook>,
    pub on_progress: Option<ProgressFn>,
    pub token: CancellationToken,
    pub logger: ArcLogger,
    pub options: ConvertOptions,
}

// Finished conversion holding the output container bytes.
pub struct Conversion {
    writer: SharedMemoryWriter,
}

impl Conversion {
    #[must_use]
    pub fn save(&self) -> Bytes {
        self.writer.bytes()
    }
}

// Runs an end-to-end conversion. The configuration is validated
// against the capability matrix before any byte is read.
pub async fn convert(request: ConvertRequest) -> Result<Conversion, ConvertError> {
    validate_config(&request)?;

    let mut writer = SharedMemoryWriter::new();
    let mut pipeline = Pipeline::new(request, writer.clone());
    if let Err(e) = pipeline.run().await {
        // Discard the partial output.
        use common::OutputWriter;
        writer.remove().await;
        return Err(e);
    }

    Ok(Conversion { writer })
}

// Accepted matrix: webm requires vp8 + opus, mp4 requires
// h264 + aac and the gate flag. Everything else is rejected.
fn validate_config(request: &ConvertRequest) -> Result<(), ConvertError> {
    use ConvertError::UnsupportedConfig;
    match request.to {
        ContainerFormat::Webm => {
            if request.video_codec != VideoCodec::Vp8 {
                return Err(UnsupportedConfig {
                    option: "video-codec",
                    value: request.video_codec.to_string(),
                });
            }
            if request.audio_codec != AudioCodec::Opus {
                return Err(UnsupportedConfig {
                    option: "audio-codec",
                    value: request.audio_codec.to_string(),
                });
            }
        }
        ContainerFormat::Mp4 => {
            if !request.options.allow_mp4_output {
                return Err(UnsupportedConfig {
                    option: "to",
                    value: "mp4".to_owned(),
                });
            }
            if request.video_codec != VideoCodec::H264 {
                return Err(UnsupportedConfig {
                    option: "video-codec",
                    value: request.video_codec.to_string(),
                });
            }
            if request.audio_codec != AudioCodec::Aac {
                return Err(UnsupportedConfig {
                    option: "audio-codec",
                    value: request.audio_codec.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn container_accepts_video(to: ContainerFormat, codec: VideoCodec) -> bool {
    match to {
        ContainerFormat::Webm => matches!(codec, VideoCodec::Vp8 | VideoCodec::Vp9),
        ContainerFormat::Mp4 => matches!(codec, VideoCodec::H264 | VideoCodec::H265),
    }
}

fn container_accepts_audio(to: ContainerFormat, codec: AudioCodec) -> bool {
    match to {
        ContainerFormat::Webm => codec == AudioCodec::Opus,
        ContainerFormat::Mp4 => codec == AudioCodec::Aac,
    }
}

fn encoder_codec_string(codec: VideoCodec) -> String {
    match codec {
        VideoCodec::H264 => "avc1.640028".to_owned(),
        VideoCodec::H265 => "hvc1.1.6.L93.B0".to_owned(),
        VideoCodec::Vp8 => "vp8".to_owned(),
        VideoCodec::Vp9 => "vp09.00.10.08".to_owned(),
        VideoCodec::Av1 => "av01.0.04M.08".to_owned(),
    }
}

fn sniff_container(head: &[u8]) -> Result<ContainerFormat, ConvertError> {
    if head.len() >= 4 && head[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        return Ok(ContainerFormat::Webm);
    }
    if head.len() >= 8
        && matches!(
            &head[4..8],
            b"ftyp" | b"styp" | b"moov" | b"moof" | b"mdat" | b"free" | b"wide"
        )
    {
        return Ok(ContainerFormat::Mp4);
    }
    Err(ConvertError::UnknownContainer)
}

enum InputDemuxer {
    Mp4(isobmff::Demuxer),
    Webm(matroska::Demuxer),
}

impl InputDemuxer {
    fn new(format: ContainerFormat) -> Self {
        match format {
            ContainerFormat::Mp4 => Self::Mp4(isobmff::Demuxer::new()),
            ContainerFormat::Webm => Self::Webm(matroska::Demuxer::new()),
        }
    }

    fn feed(&mut self, data: &[u8]) {
        match self {
            Self::Mp4(d) => d.feed(data),
            Self::Webm(d) => d.feed(data),
        }
    }

    fn poll(&mut self) -> Result<Option<DemuxEvent>, ConvertError> {
        match self {
            Self::Mp4(d) => d.poll().map_err(|e| ConvertError::MalformedContainer {
                format: ContainerFormat::Mp4,
                source: Box::new(e),
            }),
            Self::Webm(d) => d.poll().map_err(|e| ConvertError::MalformedContainer {
                format: ContainerFormat::Webm,
                source: Box::new(e),
            }),
        }
    }

    fn finish(&mut self) -> Result<(), ConvertError> {
        match self {
            Self::Mp4(d) => d.finish().map_err(|e| ConvertError::MalformedContainer {
                format: ContainerFormat::Mp4,
                source: Box::new(e),
            }),
            Self::Webm(d) => d.finish().map_err(|e| ConvertError::MalformedContainer {
                format: ContainerFormat::Webm,
                source: Box::new(e),
            }),
        }
    }
}

enum OutputMuxer {
    Webm(WebmMuxer),
    Mp4(Mp4Muxer),
}

impl OutputMuxer {
    async fn add_sample(&mut self, track: u64, chunk: &EncodedChunk) -> Result<(), DynError> {
        match self {
            Self::Webm(m) => m.add_sample(track, chunk).await.map_err(into_dyn),
            Self::Mp4(m) => m
                .add_sample(u32::try_from(track).expect("u32 fit track"), chunk)
                .await
                .map_err(into_dyn),
        }
    }

    async fn finalize(self) -> Result<(), DynError> {
        match self {
            Self::Webm(mut m) => m.finalize().await.map_err(into_dyn),
            Self::Mp4(m) => m.finalize().await.map_err(into_dyn),
        }
    }
}

fn into_dyn<E: std::error::Error + Send + Sync + 'static>(e: E) -> DynError {
    Box::new(e)
}

fn map_webm_error(e: WebmMuxerError) -> ConvertError {
    match e {
        WebmMuxerError::UnsupportedCodec(codec) => ConvertError::UnsupportedCodec {
            codec,
            context: "webm output",
        },
        other => ConvertError::Mux(Box::new(other)),
    }
}

fn map_mp4_error(e: Mp4MuxerError) -> ConvertError {
    match e {
        Mp4MuxerError::UnsupportedCodec(codec) => ConvertError::UnsupportedCodec {
            codec,
            context: "mp4 output",
        },
        other => ConvertError::Mux(Box::new(other)),
    }
}

type SharedMuxer = Arc<tokio::sync::Mutex<Option<OutputMuxer>>>;

// Counter state shared with the encoder chunk sinks.
struct ProgressState {
    inner: std::sync::Mutex<Progress>,
    callback: Option<ProgressFn>,
    token: CancellationToken,
}

impl ProgressState {
    fn note_decoded(&self, video: bool) {
        let mut progress = self.inner.lock().expect("not poisoned");
        if video {
            progress.decoded_video += 1;
        } else {
            progress.decoded_audio += 1;
        }
    }

    fn note_encoded(&self, video: bool, chunk: &EncodedChunk) {
        let snapshot = {
            let mut progress = self.inner.lock().expect("not poisoned");
            if video {
                progress.encoded_video += 1;
            } else {
                progress.encoded_audio += 1;
            }
            let end = chunk
                .timestamp
                .checked_add(chunk.duration)
                .unwrap_or(chunk.timestamp);
            progress.duration_micros = progress.duration_micros.max(DurationMicros::from(end));
            *progress
        };
        // No notifications after an abort.
        if self.token.is_cancelled() {
            return;
        }
        if let Some(callback) = &self.callback {
            callback(snapshot);
        }
    }
}

// Forwards encoded chunks from a codec stage into the muxer.
struct MuxerSink {
    muxer: SharedMuxer,
    out_track: u64,
    video: bool,
    progress: Arc<ProgressState>,
}

#[async_trait]
impl ChunkSink for MuxerSink {
    async fn chunk(&self, chunk: EncodedChunk) -> Result<(), DynError> {
        if self.progress.token.is_cancelled() {
            return Ok(());
        }
        let mut muxer = self.muxer.lock().await;
        let Some(muxer) = muxer.as_mut() else {
            return Ok(());
        };
        muxer.add_sample(self.out_track, &chunk).await?;
        self.progress.note_encoded(self.video, &chunk);
        Ok(())
    }
}

enum Route {
    // Forward the original bitstream, timestamps remapped.
    Copy { out_track: u64, video: bool },

    TranscodeVideo { stage: VideoStage },
    TranscodeAudio { stage: AudioStage },

    // Track the output container cannot carry.
    Ignore,
}

struct Pipeline {
    reader: DynSourceReader,
    to: ContainerFormat,
    video_codec: VideoCodec,
    audio_codec: AudioCodec,
    codecs: CodecFactories,
    on_video_frame: Option<VideoFrameHook>,
    token: CancellationToken,
    logger: ArcLogger,
    options: ConvertOptions,

    muxer: SharedMuxer,
    progress: Arc<ProgressState>,
    routes: HashMap<TrackId, Route>,
    timescales: HashMap<TrackId, u32>,
    writer: SharedMemoryWriter,
    input_format: ContainerFormat,
}

impl Pipeline {
    fn new(request: ConvertRequest, writer: SharedMemoryWriter) -> Self {
        let progress = Arc::new(ProgressState {
            inner: std::sync::Mutex::new(Progress::default()),
            callback: request.on_progress,
            token: request.token.clone(),
        });
        Self {
            reader: request.reader,
            to: request.to,
            video_codec: request.video_codec,
            audio_codec: request.audio_codec,
            codecs: request.codecs,
            on_video_frame: request.on_video_frame,
            token: request.token,
            logger: request.logger,
            options: request.options,
            muxer: Arc::new(tokio::sync::Mutex::new(None)),
            progress,
            routes: HashMap::new(),
            timescales: HashMap::new(),
            writer,
            input_format: ContainerFormat::Mp4,
        }
    }

    fn check_abort(&self) -> Result<(), ConvertError> {
        if self.token.is_cancelled() {
            return Err(ConvertError::Aborted);
        }
        Ok(())
    }

    fn log(&self, level: LogLevel, track_id: Option<TrackId>, message: String) {
        self.logger
            .log(LogEntry::new(level, LOG_SOURCE, track_id, message));
    }

    async fn run(&mut self) -> Result<(), ConvertError> {
        let head = self
            .reader
            .read(0, 16)
            .await
            .map_err(ConvertError::Read)?;
        let format = sniff_container(&head)?;
        self.input_format = format;
        self.log(
            LogLevel::Debug,
            None,
            format!("input container: {format}"),
        );

        *self.muxer.lock().await = Some(match self.to {
            ContainerFormat::Webm => OutputMuxer::Webm(WebmMuxer::new(
                Box::new(self.writer.clone()),
                WebmMuxerOptions {
                    write_cues: self.options.write_cues,
                    ..Default::default()
                },
            )),
            ContainerFormat::Mp4 => OutputMuxer::Mp4(Mp4Muxer::new(
                Box::new(self.writer.clone()),
                Mp4MuxerOptions {
                    moov_placement: self.options.moov_placement,
                },
            )),
        });

        let mut demuxer = InputDemuxer::new(format);
        let read_size = u32::try_from(self.options.read_size.as_u64()).unwrap_or(256 * 1024);
        let mut read_pos: u64 = 0;

        loop {
            self.check_abort()?;
            while let Some(event) = demuxer.poll()? {
                self.handle_event(event).await?;
                self.check_abort()?;
            }

            let buf = self
                .reader
                .read(read_pos, read_size)
                .await
                .map_err(ConvertError::Read)?;
            if buf.is_empty() {
                break;
            }
            read_pos += u64::try_from(buf.len()).expect("u64 fit usize");
            demuxer.feed(&buf);
        }

        demuxer.finish()?;
        while let Some(event) = demuxer.poll()? {
            self.handle_event(event).await?;
            self.check_abort()?;
        }

        // Drain every stage, then release the codec handles.
        for (track_id, route) in &mut self.routes {
            match route {
                Route::TranscodeVideo { stage } => {
                    stage.flush().await.map_err(|e| ConvertError::CodecFailure {
                        track: *track_id,
                        source: e,
                    })?;
                    stage.close().await;
                }
                Route::TranscodeAudio { stage } => {
                    stage.flush().await.map_err(|e| ConvertError::CodecFailure {
                        track: *track_id,
                        source: e,
                    })?;
                    stage.close().await;
                }
                Route::Copy { .. } | Route::Ignore => {}
            }
        }
        self.check_abort()?;

        let muxer = self
            .muxer
            .lock()
            .await
            .take()
            .expect("muxer constructed in run");
        muxer.finalize().await.map_err(ConvertError::Mux)
    }

    async fn handle_event(&mut self, event: DemuxEvent) -> Result<(), ConvertError> {
        match event {
            DemuxEvent::Track(track) => self.handle_track(track).await,
            DemuxEvent::Samples {
                track_id,
                positions,
            } => self.handle_samples(track_id, &positions).await,
        }
    }

    async fn handle_track(&mut self, track: Track) -> Result<(), ConvertError> {
        let track_id = track.id();
        self.timescales.insert(track_id, track.timescale());

        let route = match track {
            Track::Video(video) => self.route_video(&video).await?,
            Track::Audio(audio) => self.route_audio(&audio).await?,
            Track::Other(_) => {
                self.log(
                    LogLevel::Info,
                    Some(track_id),
                    "skipping unsupported track".to_owned(),
                );
                Route::Ignore
            }
        };
        self.routes.insert(track_id, route);
        Ok(())
    }

    // A track is copied when its codec is carried natively by
    // the output container, matches the requested codec and no
    // frame transform was requested.
    async fn route_video(&mut self, video: &VideoTrack) -> Result<Route, ConvertError> {
        let copy = video.codec == self.video_codec
            && container_accepts_video(self.to, video.codec)
            && self.on_video_frame.is_none();

        let mut muxer = self.muxer.lock().await;
        let muxer = muxer.as_mut().expect("muxer constructed in run");

        if copy {
            let out_track = match muxer {
                OutputMuxer::Webm(m) => m
                    .add_track(WebmTrack::Video {
                        codec: video.codec,
                        width: video.coded_width,
                        height: video.coded_height,
                        codec_private: video.codec_private.clone(),
                    })
                    .map_err(map_webm_error)?,
                OutputMuxer::Mp4(m) => u64::from(
                    m.add_video_track(
                        video.codec,
                        video.coded_width,
                        video.coded_height,
                        video.codec_private.clone().unwrap_or_default(),
                    )
                    .map_err(map_mp4_error)?,
                ),
            };
            self.log(
                LogLevel::Info,
                Some(video.id),
                format!("copying {} video", video.codec),
            );
            return Ok(Route::Copy {
                out_track,
                video: true,
            });
        }

        let Some(decoder_factory) = self.codecs.video_decoder.as_deref() else {
            return Err(ConvertError::UnsupportedConfig {
                option: "codecs.video-decoder",
                value: "none".to_owned(),
            });
        };
        let Some(encoder_factory) = self.codecs.video_encoder.as_deref() else {
            return Err(ConvertError::UnsupportedConfig {
                option: "codecs.video-encoder",
                value: "none".to_owned(),
            });
        };

        let out_track = match muxer {
            OutputMuxer::Webm(m) => m
                .add_track(WebmTrack::Video {
                    codec: self.video_codec,
                    width: video.coded_width,
                    height: video.coded_height,
                    codec_private: None,
                })
                .map_err(map_webm_error)?,
            OutputMuxer::Mp4(m) => u64::from(
                m.add_video_track(
                    self.video_codec,
                    video.coded_width,
                    video.coded_height,
                    video.codec_private.clone().unwrap_or_default(),
                )
                .map_err(map_mp4_error)?,
            ),
        };

        let decoder_config = VideoDecoderConfig {
            codec: video.codec_string.clone(),
            coded_width: video.coded_width,
            coded_height: video.coded_height,
            description: video.codec_private.clone(),
        };
        let encoder_config = VideoEncoderConfig {
            codec: encoder_codec_string(self.video_codec),
            width: video.coded_width,
            height: video.coded_height,
            bitrate: self.options.video_bitrate,
            framerate: self.options.framerate,
            latency_mode: self.options.latency_mode,
        };
        let sink = Box::new(MuxerSink {
            muxer: self.muxer.clone(),
            out_track,
            video: true,
            progress: self.progress.clone(),
        });

        let stage = VideoStage::new(
            decoder_factory,
            &decoder_config,
            encoder_factory,
            &encoder_config,
            sink,
            self.on_video_frame.take(),
        )
        .map_err(|e| ConvertError::CodecFailure {
            track: video.id,
            source: StageError::Decode(Arc::new(e)),
        })?;

        self.log(
            LogLevel::Info,
            Some(video.id),
            format!("transcoding {} to {}", video.codec, self.video_codec),
        );
        Ok(Route::TranscodeVideo { stage })
    }

    async fn route_audio(&mut self, audio: &AudioTrack) -> Result<Route, ConvertError> {
        let copy =
            audio.codec == self.audio_codec && container_accepts_audio(self.to, audio.codec);

        let mut muxer = self.muxer.lock().await;
        let muxer = muxer.as_mut().expect("muxer constructed in run");

        if copy {
            let out_track = match muxer {
                OutputMuxer::Webm(m) => m
                    .add_track(WebmTrack::Audio {
                        codec: audio.codec,
                        channels: audio.number_of_channels,
                        sample_rate: audio.sample_rate,
                        codec_private: audio.codec_private.clone(),
                    })
                    .map_err(map_webm_error)?,
                OutputMuxer::Mp4(m) => u64::from(
                    m.add_audio_track(
                        audio.codec,
                        audio.number_of_channels,
                        audio.sample_rate,
                        audio.codec_private.clone().unwrap_or_default(),
                    )
                    .map_err(map_mp4_error)?,
                ),
            };
            self.log(
                LogLevel::Info,
                Some(audio.id),
                format!("copying {} audio", audio.codec),
            );
            return Ok(Route::Copy {
                out_track,
                video: false,
            });
        }

        let Some(decoder_factory) = self.codecs.audio_decoder.as_deref() else {
            return Err(ConvertError::UnsupportedConfig {
                option: "codecs.audio-decoder",
                value: "none".to_owned(),
            });
        };
        let Some(encoder_factory) = self.codecs.audio_encoder.as_deref() else {
            return Err(ConvertError::UnsupportedConfig {
                option: "codecs.audio-encoder",
                value: "none".to_owned(),
            });
        };

        let out_track = match muxer {
            OutputMuxer::Webm(m) => m
                .add_track(WebmTrack::Audio {
                    codec: self.audio_codec,
                    channels: audio.number_of_channels,
                    sample_rate: audio.sample_rate,
                    codec_private: None,
                })
                .map_err(map_webm_error)?,
            OutputMuxer::Mp4(m) => u64::from(
                m.add_audio_track(
                    self.audio_codec,
                    audio.number_of_channels,
                    audio.sample_rate,
                    audio.codec_private.clone().unwrap_or_default(),
                )
                .map_err(map_mp4_error)?,
            ),
        };

        let decoder_config = AudioDecoderConfig {
            codec: audio.codec_string.clone(),
            number_of_channels: audio.number_of_channels,
            sample_rate: audio.sample_rate,
            description: audio.codec_private.clone(),
        };
        let encoder_config = AudioEncoderConfig {
            codec: match self.audio_codec {
                AudioCodec::Aac => "mp4a.40.2".to_owned(),
                other => other.as_str().to_owned(),
            },
            number_of_channels: audio.number_of_channels,
            sample_rate: audio.sample_rate,
            bitrate: self.options.audio_bitrate,
        };
        let sink = Box::new(MuxerSink {
            muxer: self.muxer.clone(),
            out_track,
            video: false,
            progress: self.progress.clone(),
        });

        let stage = AudioStage::new(
            decoder_factory,
            &decoder_config,
            encoder_factory,
            &encoder_config,
            sink,
        )
        .map_err(|e| ConvertError::CodecFailure {
            track: audio.id,
            source: StageError::Decode(Arc::new(e)),
        })?;

        self.log(
            LogLevel::Info,
            Some(audio.id),
            format!("transcoding {} to {}", audio.codec, self.audio_codec),
        );
        Ok(Route::TranscodeAudio { stage })
    }

    async fn handle_samples(
        &mut self,
        track_id: TrackId,
        positions: &[SamplePosition],
    ) -> Result<(), ConvertError> {
        let timescale = self.timescales.get(&track_id).copied().unwrap_or(1_000_000);

        for position in positions {
            self.check_abort()?;

            let Some(route) = self.routes.get(&track_id) else {
                continue;
            };
            if matches!(route, Route::Ignore) {
                continue;
            }

            let data = self
                .reader
                .read(position.file_offset, position.size)
                .await
                .map_err(ConvertError::Read)?;
            if data.len() < usize::try_from(position.size).expect("usize fit u32") {
                return Err(ConvertError::MalformedContainer {
                    format: self.input_format,
                    source: format!(
                        "sample at offset {} extends past the end of the input",
                        position.file_offset,
                    )
                    .into(),
                });
            }

            let chunk = EncodedChunk::from_position(track_id, position, timescale, data);

            let route = self.routes.get_mut(&track_id).expect("checked above");
            match route {
                Route::Copy { out_track, video } => {
                    let out_track = *out_track;
                    let video = *video;
                    let mut muxer = self.muxer.lock().await;
                    let muxer = muxer.as_mut().expect("muxer constructed in run");
                    muxer
                        .add_sample(out_track, &chunk)
                        .await
                        .map_err(ConvertError::Mux)?;
                    self.progress.note_encoded(video, &chunk);
                }
                Route::TranscodeVideo { stage } => {
                    self.progress.note_decoded(true);
                    stage
                        .push_chunk(chunk)
                        .await
                        .map_err(|e| ConvertError::CodecFailure {
                            track: track_id,
                            source: e,
                        })?;
                }
                Route::TranscodeAudio { stage } => {
                    self.progress.note_decoded(false);
                    stage
                        .push_chunk(chunk)
                        .await
                        .map_err(|e| ConvertError::CodecFailure {
                            track: track_id,
                            source: e,
                        })?;
                }
                Route::Ignore => {}
            }
        }
        Ok(())
    }
}
