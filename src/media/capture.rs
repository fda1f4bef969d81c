//! System microphone capture (`system-audio` feature).
//!
//! Audio runs on a dedicated thread since `cpal::Stream` is `!Send`;
//! captured samples are downmixed to mono, Opus-encoded in 20 ms frames,
//! and handed to the endpoint through the feed channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use log::{error, info, warn};
use opus::{Application, Channels, Encoder as OpusEncoder};
use tokio::sync::{mpsc, oneshot};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use super::source::{CameraFacing, MediaFeed, MediaFrame, MediaSource};
use crate::error::MediaError;

/// Opus operates natively at 48 kHz.
const CAPTURE_SAMPLE_RATE: u32 = 48_000;

/// 20 ms frames: 960 samples at 48 kHz.
const FRAME_SIZE_SAMPLES: usize = 960;

const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Maximum encoded Opus frame size in bytes.
const MAX_OPUS_FRAME_SIZE: usize = 512;

const OPUS_BITRATE: i32 = 24_000;

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: CAPTURE_SAMPLE_RATE,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        ..Default::default()
    }
}

/// Microphone-backed [`MediaSource`]. There is no camera backend on this
/// source; video requests (and camera switches) report `DeviceUnavailable`
/// and the call proceeds audio-only.
#[derive(Debug, Default)]
pub struct CpalAudioSource;

impl CpalAudioSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for CpalAudioSource {
    async fn open_audio(&self) -> Result<MediaFeed, MediaError> {
        let (frame_tx, frame_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        std::thread::spawn(move || {
            run_capture(frame_tx, thread_stop, ready_tx);
        });

        ready_rx
            .await
            .map_err(|_| MediaError::device_unavailable("capture thread died during startup"))??;

        Ok(MediaFeed {
            codec: opus_capability(),
            frames: frame_rx,
            stop,
        })
    }

    async fn open_video(&self, _facing: CameraFacing) -> Result<MediaFeed, MediaError> {
        Err(MediaError::device_unavailable(
            "no camera backend on this source",
        ))
    }
}

fn run_capture(
    frames: mpsc::Sender<MediaFrame>,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), MediaError>>,
) {
    let setup = || -> Result<(cpal::Device, StreamConfig), MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::device_unavailable("no input device"))?;
        info!(
            target: "Call/Media",
            "capture device: {}",
            device.name().unwrap_or_default()
        );

        // Accept mono or stereo at 48 kHz; stereo gets downmixed.
        let supported = device
            .supported_input_configs()
            .map_err(|e| MediaError::permission_denied(e.to_string()))?;
        let mut best = None;
        for cfg in supported {
            let rate_ok = cfg.min_sample_rate().0 <= CAPTURE_SAMPLE_RATE
                && cfg.max_sample_rate().0 >= CAPTURE_SAMPLE_RATE;
            if rate_ok && cfg.channels() <= 2 {
                if cfg.channels() == 1 || best.is_none() {
                    let mono = cfg.channels() == 1;
                    best = Some(cfg.with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE)));
                    if mono {
                        break;
                    }
                }
            }
        }
        let config: StreamConfig = best
            .ok_or_else(|| MediaError::device_unavailable("no 48 kHz input config"))?
            .into();
        Ok((device, config))
    };

    let (device, config) = match setup() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut encoder = match OpusEncoder::new(CAPTURE_SAMPLE_RATE, Channels::Mono, Application::Voip)
    {
        Ok(encoder) => encoder,
        Err(e) => {
            let _ = ready.send(Err(MediaError::device_unavailable(format!(
                "opus encoder: {e}"
            ))));
            return;
        }
    };
    if let Err(e) = encoder.set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE)) {
        warn!(target: "Call/Media", "opus bitrate not applied: {e}");
    }

    let channels = config.channels as usize;
    let buffer = Arc::new(std::sync::Mutex::new(Vec::with_capacity(
        FRAME_SIZE_SAMPLES * 2,
    )));
    let callback_buffer = buffer.clone();

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mut buffer = callback_buffer.lock().unwrap();
            if channels == 1 {
                buffer.extend_from_slice(data);
            } else {
                for chunk in data.chunks(channels) {
                    buffer.push(chunk.iter().sum::<f32>() / channels as f32);
                }
            }
        },
        |err| error!(target: "Call/Media", "capture stream error: {err}"),
        None,
    );
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(MediaError::permission_denied(e.to_string())));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(MediaError::permission_denied(e.to_string())));
        return;
    }
    if ready.send(Ok(())).is_err() {
        return;
    }
    info!(target: "Call/Media", "microphone capture started");

    let mut encoded = vec![0u8; MAX_OPUS_FRAME_SIZE];
    while !stop.load(Ordering::Relaxed) {
        let frame: Option<Vec<i16>> = {
            let mut buffer = buffer.lock().unwrap();
            if buffer.len() >= FRAME_SIZE_SAMPLES {
                let samples: Vec<f32> = buffer.drain(..FRAME_SIZE_SAMPLES).collect();
                Some(
                    samples
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect(),
                )
            } else {
                None
            }
        };

        match frame {
            Some(samples) => match encoder.encode(&samples, &mut encoded) {
                Ok(len) => {
                    let frame = MediaFrame {
                        data: encoded[..len].to_vec().into(),
                        duration: FRAME_DURATION,
                    };
                    if frames.blocking_send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(target: "Call/Media", "opus encode failed: {e}"),
            },
            None => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    drop(stream);
    info!(target: "Call/Media", "microphone capture stopped");
}
