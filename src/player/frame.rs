use ffmpeg_next::util::frame;
use ffmpeg_next::{format, Rational};

use crate::player::frame_queue::QueuedFrame;

/// 解码后的视频帧及展示元数据
pub struct PictureFrame {
    pub frame: frame::Video,
    pub pts: f64,
    pub duration: f64,
    pub serial: i32,
    /// 源文件字节位置（未知为 -1）
    pub pos: i64,
    pub width: u32,
    pub height: u32,
    pub format: format::Pixel,
    pub sample_aspect_ratio: Rational,
    /// 展示端是否已上传纹理
    pub uploaded: bool,
    pub flip_v: bool,
}

impl Default for PictureFrame {
    fn default() -> Self {
        Self {
            frame: frame::Video::empty(),
            pts: f64::NAN,
            duration: 0.0,
            serial: -1,
            pos: -1,
            width: 0,
            height: 0,
            format: format::Pixel::None,
            sample_aspect_ratio: Rational::new(0, 1),
            uploaded: false,
            flip_v: false,
        }
    }
}

impl QueuedFrame for PictureFrame {
    fn serial(&self) -> i32 {
        self.serial
    }

    fn pos(&self) -> i64 {
        self.pos
    }

    fn clear(&mut self) {
        self.frame = frame::Video::empty();
        self.uploaded = false;
    }
}

/// 解码后的音频帧
pub struct SampleFrame {
    pub frame: frame::Audio,
    pub pts: f64,
    pub duration: f64,
    pub serial: i32,
    pub pos: i64,
}

impl Default for SampleFrame {
    fn default() -> Self {
        Self {
            frame: frame::Audio::empty(),
            pts: f64::NAN,
            duration: 0.0,
            serial: -1,
            pos: -1,
        }
    }
}

impl QueuedFrame for SampleFrame {
    fn serial(&self) -> i32 {
        self.serial
    }

    fn pos(&self) -> i64 {
        self.pos
    }

    fn clear(&mut self) {
        self.frame = frame::Audio::empty();
    }
}
