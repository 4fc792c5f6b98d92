// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    AudioDecoderFactory, AudioEncoderFactory, AudioFrame, AudioFrameSink, DynAudioDecoder,
    DynAudioEncoder, DynChunkSink, DynVideoDecoder, DynVideoEncoder, VideoDecoderFactory,
    VideoEncoderFactory, VideoFrame, VideoFrameHook, VideoFrameSink,
};
use async_trait::async_trait;
use common::{DynError, EncodedChunk};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use thiserror::Error;
use tokio::sync::Semaphore;

// Bounded decode windows. Video frames are large, audio frames
// are plentiful.
pub const VIDEO_IN_FLIGHT_LIMIT: usize = 8;
pub const AUDIO_IN_FLIGHT_LIMIT: usize = 32;

#[derive(Debug, Error, Clone)]
pub enum StageError {
    #[error("stage is closed")]
    Closed,

    #[error("decode: {0}")]
    Decode(Arc<DynError>),

    #[error("encode: {0}")]
    Encode(Arc<DynError>),

    #[error("frame hook: {0}")]
    FrameHook(Arc<DynError>),

    #[error("flush: {0}")]
    Flush(Arc<DynError>),
}

// State shared between the stage and its frame sink. The first
// error wins and is re-raised on every later interaction.
struct StageShared {
    window: Semaphore,
    error: Mutex<Option<StageError>>,
    closed: AtomicBool,
}

impl StageShared {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            window: Semaphore::new(limit),
            error: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn store_error(&self, error: StageError) {
        let mut slot = self.error.lock().expect("not poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn check(&self) -> Result<(), StageError> {
        if let Some(error) = self.error.lock().expect("not poisoned").clone() {
            return Err(error);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StageError::Closed);
        }
        Ok(())
    }
}

// Decoder side of the video frame path: frees a window slot,
// runs the optional user hook and forwards to the encoder.
struct VideoStageSink {
    shared: Arc<StageShared>,
    encoder: Arc<tokio::sync::Mutex<DynVideoEncoder>>,
    hook: Option<VideoFrameHook>,
}

#[async_trait]
impl VideoFrameSink for VideoStageSink {
    async fn frame(&self, frame: VideoFrame) -> Result<(), DynError> {
        self.shared.window.add_permits(1);

        let frame = match &self.hook {
            Some(hook) => match hook(frame) {
                Ok(v) => v,
                Err(e) => {
                    self.shared.store_error(StageError::FrameHook(Arc::new(e)));
                    return Ok(());
                }
            },
            None => frame,
        };

        if let Err(e) = self.encoder.lock().await.encode(frame, false).await {
            self.shared.store_error(StageError::Encode(Arc::new(e)));
        }
        Ok(())
    }
}

// One per transcoded video track.
pub struct VideoStage {
    decoder: DynVideoDecoder,
    encoder: Arc<tokio::sync::Mutex<DynVideoEncoder>>,
    shared: Arc<StageShared>,
}

impl VideoStage {
    pub fn new(
        decoder_factory: &dyn VideoDecoderFactory,
        decoder_config: &crate::VideoDecoderConfig,
        encoder_factory: &dyn VideoEncoderFactory,
        encoder_config: &crate::VideoEncoderConfig,
        chunk_sink: DynChunkSink,
        hook: Option<VideoFrameHook>,
    ) -> Result<Self, DynError> {
        let shared = StageShared::new(VIDEO_IN_FLIGHT_LIMIT);
        let encoder = Arc::new(tokio::sync::Mutex::new(
            encoder_factory.open(encoder_config, chunk_sink)?,
        ));
        let sink = Box::new(VideoStageSink {
            shared: shared.clone(),
            encoder: encoder.clone(),
            hook,
        });
        let decoder = decoder_factory.open(decoder_config, sink)?;
        Ok(Self {
            decoder,
            encoder,
            shared,
        })
    }

    // Enqueues one chunk for decoding, suspending while the
    // in-flight window is full.
    pub async fn push_chunk(&mut self, chunk: EncodedChunk) -> Result<(), StageError> {
        self.shared.check()?;
        let permit = self
            .shared
            .window
            .acquire()
            .await
            .map_err(|_| StageError::Closed)?;
        // The sink returns the slot once the frame comes out.
        permit.forget();

        if let Err(e) = self.decoder.decode(chunk).await {
            let error = StageError::Decode(Arc::new(e));
            self.shared.store_error(error.clone());
            return Err(error);
        }
        self.shared.check()
    }

    // Drains the decoder, then the encoder.
    pub async fn flush(&mut self) -> Result<(), StageError> {
        self.shared.check()?;
        if let Err(e) = self.decoder.flush().await {
            let error = StageError::Flush(Arc::new(e));
            self.shared.store_error(error.clone());
            return Err(error);
        }
        if let Err(e) = self.encoder.lock().await.flush().await {
            let error = StageError::Flush(Arc::new(e));
            self.shared.store_error(error.clone());
            return Err(error);
        }
        self.shared.check()
    }

    pub async fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.window.close();
        self.decoder.close().await;
        self.encoder.lock().await.close().await;
    }

    // First stored decoder or encoder error, if any.
    #[must_use]
    pub fn error(&self) -> Option<StageError> {
        self.shared.error.lock().expect("not poisoned").clone()
    }
}

struct AudioStageSink {
    shared: Arc<StageShared>,
    encoder: Arc<tokio::sync::Mutex<DynAudioEncoder>>,
}

#[async_trait]
impl AudioFrameSink for AudioStageSink {
    async fn frame(&self, frame: AudioFrame) -> Result<(), DynError> {
        self.shared.window.add_permits(1);
        if let Err(e) = self.encoder.lock().await.encode(frame).await {
            self.shared.store_error(StageError::Encode(Arc::new(e)));
        }
        Ok(())
    }
}

// One per transcoded audio track.
pub struct AudioStage {
    decoder: DynAudioDecoder,
    encoder: Arc<tokio::sync::Mutex<DynAudioEncoder>>,
    shared: Arc<StageShared>,
}

impl AudioStage {
    pub fn new(
        decoder_factory: &dyn AudioDecoderFactory,
        decoder_config: &crate::AudioDecoderConfig,
        encoder_factory: &dyn AudioEncoderFactory,
        encoder_config: &crate::AudioEncoderConfig,
        chunk_sink: DynChunkSink,
    ) -> Result<Self, DynError> {
        let shared = StageShared::new(AUDIO_IN_FLIGHT_LIMIT);
        let encoder = Arc::new(tokio::sync::Mutex::new(
            encoder_factory.open(encoder_config, chunk_sink)?,
        ));
        let sink = Box::new(AudioStageSink {
            shared: shared.clone(),
            encoder: encoder.clone(),
        });
        let decoder = decoder_factory.open(decoder_config, sink)?;
        Ok(Self {
            decoder,
            encoder,
            shared,
        })
    }

    pub async fn push_chunk(&mut self, chunk: EncodedChunk) -> Result<(), StageError> {
        self.shared.check()?;
        let permit = self
            .shared
            .window
            .acquire()
            .await
            .map_err(|_| StageError::Closed)?;
        permit.forget();

        if let Err(e) = self.decoder.decode(chunk).await {
            let error = StageError::Decode(Arc::new(e));
            self.shared.store_error(error.clone());
            return Err(error);
        }
        self.shared.check()
    }

    pub async fn flush(&mut self) -> Result<(), StageError> {
        self.shared.check()?;
        if let Err(e) = self.decoder.flush().await {
            let error = StageError::Flush(Arc::new(e));
            self.shared.store_error(error.clone());
            return Err(error);
        }
        if let Err(e) = self.encoder.lock().await.flush().await {
            let error = StageError::Flush(Arc::new(e));
            self.shared.store_error(error.clone());
            return Err(error);
        }
        self.shared.check()
    }

    pub async fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.window.close();
        self.decoder.close().await;
        self.encoder.lock().await.close().await;
    }

    #[must_use]
    pub fn error(&self) -> Option<StageError> {
        self.shared.error.lock().expect("not poisoned").clone()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DynVideoFrameSink, LatencyMode, VideoDecoder, VideoDecoderConfig, VideoEncoder,
        VideoEncoderConfig,
    };
    use bytes::Bytes;
    use common::{
        time::{DurationMicros, Micros},
        TrackId,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn chunk(ts: i64) -> EncodedChunk {
        EncodedChunk {
            track_id: TrackId::new(1),
            data: Bytes::from_static(b"frame"),
            timestamp: Micros::new(ts),
            duration: DurationMicros::new(33_333),
            is_keyframe: true,
        }
    }

    fn frame(ts: i64) -> VideoFrame {
        VideoFrame {
            timestamp: Micros::new(ts),
            duration: Some(DurationMicros::new(33_333)),
            coded_width: 640,
            coded_height: 360,
            data: Bytes::from_static(b"pixels"),
        }
    }

    // Decoder that immediately emits one frame per chunk.
    struct InstantDecoder {
        sink: DynVideoFrameSink,
        fail: bool,
    }

    #[async_trait]
    impl VideoDecoder for InstantDecoder {
        async fn decode(&mut self, chunk: EncodedChunk) -> Result<(), DynError> {
            if self.fail {
                return Err("bitstream error".into());
            }
            self.sink.frame(frame(*chunk.timestamp)).await
        }

        async fn flush(&mut self) -> Result<(), DynError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct InstantDecoderFactory {
        fail: bool,
    }

    impl VideoDecoderFactory for InstantDecoderFactory {
        fn open(
            &self,
            _: &VideoDecoderConfig,
            sink: DynVideoFrameSink,
        ) -> Result<DynVideoDecoder, DynError> {
            Ok(Box::new(InstantDecoder {
                sink,
                fail: self.fail,
            }))
        }
    }

    // Decoder that swallows chunks and never emits frames.
    struct StallingDecoder;

    #[async_trait]
    impl VideoDecoder for StallingDecoder {
        async fn decode(&mut self, _: EncodedChunk) -> Result<(), DynError> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), DynError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct StallingDecoderFactory;

    impl VideoDecoderFactory for StallingDecoderFactory {
        fn open(
            &self,
            _: &VideoDecoderConfig,
            _: DynVideoFrameSink,
        ) -> Result<DynVideoDecoder, DynError> {
            Ok(Box::new(StallingDecoder))
        }
    }

    struct PassthroughEncoder {
        sink: DynChunkSink,
    }

    #[async_trait]
    impl VideoEncoder for PassthroughEncoder {
        async fn encode(&mut self, frame: VideoFrame, _: bool) -> Result<(), DynError> {
            self.sink
                .chunk(EncodedChunk {
                    track_id: TrackId::new(1),
                    data: frame.data,
                    timestamp: frame.timestamp,
                    duration: frame.duration.unwrap_or_default(),
                    is_keyframe: true,
                })
                .await
        }

        async fn flush(&mut self) -> Result<(), DynError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct PassthroughEncoderFactory;

    impl VideoEncoderFactory for PassthroughEncoderFactory {
        fn open(
            &self,
            _: &VideoEncoderConfig,
            sink: DynChunkSink,
        ) -> Result<DynVideoEncoder, DynError> {
            Ok(Box::new(PassthroughEncoder { sink }))
        }
    }

    struct CollectSink(Arc<Mutex<Vec<EncodedChunk>>>);

    #[async_trait]
    impl crate::ChunkSink for CollectSink {
        async fn chunk(&self, chunk: EncodedChunk) -> Result<(), DynError> {
            self.0.lock().unwrap().push(chunk);
            Ok(())
        }
    }

    fn decoder_config() -> VideoDecoderConfig {
        VideoDecoderConfig {
            codec: "avc1.640016".to_owned(),
            coded_width: 640,
            coded_height: 360,
            description: None,
        }
    }

    fn encoder_config() -> VideoEncoderConfig {
        VideoEncoderConfig {
            codec: "vp8".to_owned(),
            width: 640,
            height: 360,
            bitrate: 1_000_000,
            framerate: 30.0,
            latency_mode: LatencyMode::Quality,
        }
    }

    #[tokio::test]
    async fn test_chunks_flow_through() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut stage = VideoStage::new(
            &InstantDecoderFactory { fail: false },
            &decoder_config(),
            &PassthroughEncoderFactory,
            &encoder_config(),
            Box::new(CollectSink(collected.clone())),
            None,
        )
        .unwrap();

        for i in 0..20 {
            stage.push_chunk(chunk(i * 33_333)).await.unwrap();
        }
        stage.flush().await.unwrap();
        stage.close().await;

        let chunks = collected.lock().unwrap();
        assert_eq!(20, chunks.len());
        assert_eq!(Micros::new(0), chunks[0].timestamp);
        assert_eq!(Micros::new(19 * 33_333), chunks[19].timestamp);
    }

    #[tokio::test]
    async fn test_frame_hook_runs_between_decode_and_encode() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let hook: VideoFrameHook = Box::new(|mut frame| {
            frame.data = Bytes::from_static(b"hooked");
            Ok(frame)
        });
        let mut stage = VideoStage::new(
            &InstantDecoderFactory { fail: false },
            &decoder_config(),
            &PassthroughEncoderFactory,
            &encoder_config(),
            Box::new(CollectSink(collected.clone())),
            Some(hook),
        )
        .unwrap();

        stage.push_chunk(chunk(0)).await.unwrap();
        stage.flush().await.unwrap();

        assert_eq!(
            Bytes::from_static(b"hooked"),
            collected.lock().unwrap()[0].data,
        );
    }

    #[tokio::test]
    async fn test_backpressure_suspends_push() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut stage = VideoStage::new(
            &StallingDecoderFactory,
            &decoder_config(),
            &PassthroughEncoderFactory,
            &encoder_config(),
            Box::new(CollectSink(collected)),
            None,
        )
        .unwrap();

        // The window accepts exactly the in-flight limit.
        for i in 0..VIDEO_IN_FLIGHT_LIMIT {
            stage
                .push_chunk(chunk(i64::try_from(i).unwrap()))
                .await
                .unwrap();
        }

        let overflow = tokio::time::timeout(
            Duration::from_millis(20),
            stage.push_chunk(chunk(99)),
        )
        .await;
        assert!(overflow.is_err(), "push past the window must suspend");
    }

    #[tokio::test]
    async fn test_decoder_error_is_latched() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut stage = VideoStage::new(
            &InstantDecoderFactory { fail: true },
            &decoder_config(),
            &PassthroughEncoderFactory,
            &encoder_config(),
            Box::new(CollectSink(collected)),
            None,
        )
        .unwrap();

        assert!(matches!(
            stage.push_chunk(chunk(0)).await,
            Err(StageError::Decode(_)),
        ));
        // The stored error is re-raised on the next interaction.
        assert!(matches!(
            stage.push_chunk(chunk(1)).await,
            Err(StageError::Decode(_)),
        ));
        assert!(stage.error().is_some());
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut stage = VideoStage::new(
            &InstantDecoderFactory { fail: false },
            &decoder_config(),
            &PassthroughEncoderFactory,
            &encoder_config(),
            Box::new(CollectSink(collected)),
            None,
        )
        .unwrap();

        stage.close().await;
        assert!(matches!(
            stage.push_chunk(chunk(0)).await,
            Err(StageError::Closed),
        ));
    }
}
