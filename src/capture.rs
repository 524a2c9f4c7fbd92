//! 화면 캡처 백엔드와 프레임 인코더
//!
//! 캡처는 동기 API이므로 blocking 스레드에서 열고 같은 스레드에서 읽는다.

use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use tracing::debug;

use crate::{Error, Result};

/// 캡처된 원본 프레임 (RGBA8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    pub fn is_valid(&self) -> bool {
        let expected = u64::from(self.width)
            .checked_mul(u64::from(self.height))
            .and_then(|pixels| pixels.checked_mul(4));
        self.width > 0 && self.height > 0 && expected == Some(self.data.len() as u64)
    }
}

/// 열린 캡처 스트림
pub trait FrameSource {
    /// 다음 프레임 (블로킹)
    fn next_frame(&mut self) -> Result<RawFrame>;
}

/// 캡처 장치 팩토리
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    /// 캡처 시작. 권한이나 장치가 없으면 CaptureUnavailable.
    fn open(&self, frame_rate: u32) -> Result<Box<dyn FrameSource>>;
}

/// 플랫폼 기본 백엔드
///
/// `scap` 기능이 켜져 있고 지원되는 플랫폼이면 실제 캡처, 아니면 항상 실패하는 백엔드.
pub fn default_backend() -> Arc<dyn CaptureBackend> {
    #[cfg(feature = "scap")]
    {
        if scap::is_supported() {
            return Arc::new(ScapBackend::primary_display());
        }
    }
    Arc::new(UnavailableBackend)
}

/// 움직이는 그라디언트를 만드는 합성 백엔드
#[derive(Debug, Clone)]
pub struct TestPatternBackend {
    width: u32,
    height: u32,
}

impl TestPatternBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl Default for TestPatternBackend {
    fn default() -> Self {
        Self::new(64, 48)
    }
}

impl CaptureBackend for TestPatternBackend {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(&self, _frame_rate: u32) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(TestPatternSource {
            width: self.width,
            height: self.height,
            tick: 0,
        }))
    }
}

struct TestPatternSource {
    width: u32,
    height: u32,
    tick: u32,
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Result<RawFrame> {
        let (w, h) = (self.width, self.height);
        let shift = self.tick % w.max(1);
        let mut data = Vec::with_capacity(w as usize * h as usize * 4);
        for y in 0..h {
            for x in 0..w {
                data.push(((u64::from(x) + u64::from(shift)) % u64::from(w) * 255 / u64::from(w)) as u8);
                data.push((u64::from(y) * 255 / u64::from(h.max(1))) as u8);
                data.push(self.tick.wrapping_mul(7) as u8);
                data.push(255);
            }
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(RawFrame {
            data,
            width: w,
            height: h,
        })
    }
}

/// 캡처 불가 환경용 백엔드
#[derive(Debug, Clone, Default)]
pub struct UnavailableBackend;

impl CaptureBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn open(&self, _frame_rate: u32) -> Result<Box<dyn FrameSource>> {
        Err(Error::CaptureUnavailable(
            "화면 캡처를 지원하지 않는 빌드 또는 플랫폼".into(),
        ))
    }
}

#[cfg(feature = "scap")]
pub use self::scap_backend::ScapBackend;

#[cfg(feature = "scap")]
mod scap_backend {
    use super::{CaptureBackend, FrameSource, RawFrame};
    use crate::{Error, Result};

    /// scap 기반 디스플레이 캡처
    #[derive(Debug, Clone, Default)]
    pub struct ScapBackend {
        display_id: Option<u32>,
    }

    impl ScapBackend {
        pub fn primary_display() -> Self {
            Self { display_id: None }
        }

        pub fn display(display_id: u32) -> Self {
            Self {
                display_id: Some(display_id),
            }
        }
    }

    impl CaptureBackend for ScapBackend {
        fn name(&self) -> &str {
            "scap"
        }

        fn open(&self, frame_rate: u32) -> Result<Box<dyn FrameSource>> {
            if !scap::is_supported() {
                return Err(Error::CaptureUnavailable("플랫폼 미지원".into()));
            }
            if !scap::has_permission() {
                return Err(Error::CaptureUnavailable("화면 캡처 권한 없음".into()));
            }

            let target = match self.display_id {
                Some(id) => Some(
                    scap::get_all_targets()
                        .into_iter()
                        .find(|t| matches!(t, scap::Target::Display(d) if d.id == id))
                        .ok_or_else(|| Error::CaptureUnavailable(format!("디스플레이 {} 없음", id)))?,
                ),
                None => None,
            };

            let options = scap::capturer::Options {
                fps: frame_rate,
                target,
                show_cursor: true,
                show_highlight: false,
                output_type: scap::frame::FrameType::BGRAFrame,
                ..Default::default()
            };

            let mut capturer = scap::capturer::Capturer::build(options)
                .map_err(|e| Error::CaptureUnavailable(format!("캡처 생성 실패: {:?}", e)))?;
            capturer.start_capture();
            tracing::info!("screen capture started");

            Ok(Box::new(ScapSource { capturer }))
        }
    }

    struct ScapSource {
        capturer: scap::capturer::Capturer,
    }

    impl FrameSource for ScapSource {
        fn next_frame(&mut self) -> Result<RawFrame> {
            loop {
                let frame = self
                    .capturer
                    .get_next_frame()
                    .map_err(|e| Error::CaptureUnavailable(format!("프레임 수신 실패: {}", e)))?;
                if let Some(raw) = frame_to_raw(frame) {
                    return Ok(raw);
                }
            }
        }
    }

    impl Drop for ScapSource {
        fn drop(&mut self) {
            self.capturer.stop_capture();
            tracing::info!("screen capture stopped");
        }
    }

    fn frame_to_raw(frame: scap::frame::Frame) -> Option<RawFrame> {
        use scap::frame::{Frame, VideoFrame};

        match frame {
            Frame::Video(VideoFrame::BGRA(f)) => {
                let mut data = f.data;
                for px in data.chunks_exact_mut(4) {
                    px.swap(0, 2);
                }
                Some(RawFrame {
                    data,
                    width: f.width as u32,
                    height: f.height as u32,
                })
            }
            Frame::Video(VideoFrame::RGBx(f)) => Some(RawFrame {
                data: f.data,
                width: f.width as u32,
                height: f.height as u32,
            }),
            _ => {
                tracing::warn!("unsupported frame format from screen capture");
                None
            }
        }
    }
}

/// 프레임 JPEG 인코더
///
/// 모든 프레임이 독립적으로 디코딩 가능하다 (키프레임 전용).
#[derive(Debug, Clone, Copy)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &RawFrame) -> Result<Bytes> {
        if !frame.is_valid() {
            return Err(Error::Encode(format!(
                "잘못된 프레임: {}x{}, {} bytes",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }

        // JPEG은 알파 채널 없음
        let rgb: Vec<u8> = frame
            .data
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();

        let mut out = Vec::with_capacity(rgb.len() / 8);
        ImageJpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|e| Error::Encode(e.to_string()))?;

        debug!(
            "프레임 인코딩: {}x{} → {} bytes",
            frame.width,
            frame.height,
            out.len()
        );
        Ok(Bytes::from(out))
    }
}
