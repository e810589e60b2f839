use ffmpeg_next::{format, ChannelLayout, Rational};
use serde::{Deserialize, Serialize};

/// 音视频同步的主时钟选择
///
/// 带回退：AudioMaster 在无音频流时退到 ExternalClock，
/// VideoMaster 在无视频流时退到 AudioMaster。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvSyncType {
    AudioMaster,
    VideoMaster,
    ExternalClock,
}

/// 音频输出参数（与宿主设备协商的结果）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParams {
    pub freq: u32,
    pub channel_layout: ChannelLayout,
    pub format: format::Sample,
    pub frame_size: usize,
    pub bytes_per_sec: usize,
}

impl AudioParams {
    pub fn channels(&self) -> usize {
        self.channel_layout.channels() as usize
    }

    /// 从采样率/布局/格式推出整套参数
    pub fn derive(freq: u32, channel_layout: ChannelLayout, format: format::Sample) -> Self {
        let channels = channel_layout.channels() as usize;
        Self {
            freq,
            channel_layout,
            format,
            frame_size: channels * format.bytes(),
            bytes_per_sec: freq as usize * channels * format.bytes(),
        }
    }
}

/// 章节信息（打开时从容器快照）
#[derive(Debug, Clone)]
pub struct ChapterInfo {
    pub start: i64,
    pub end: i64,
    pub time_base: Rational,
}

/// 打开后的媒体源快照（代替直接暴露 FFmpeg 上下文）
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub url: String,
    pub format_name: String,
    /// 容器起始时间（微秒）
    pub start_time: Option<i64>,
    /// 总时长（微秒）
    pub duration: Option<i64>,
    pub bit_rate: i64,
    /// 实时源（RTP/RTSP/SDP/UDP）
    pub realtime: bool,
    /// 相邻帧 PTS 差的合法上限（秒）：时间戳可间断的容器 10s，否则 3600s
    pub max_frame_duration: f64,
    pub chapters: Vec<ChapterInfo>,
}

/// 队列缓冲状态（用于监控和调试）
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// 视频包队列长度
    pub video_packets: usize,

    /// 音频包队列长度
    pub audio_packets: usize,

    /// 视频包队列字节数
    pub video_bytes: usize,

    /// 音频包队列字节数
    pub audio_bytes: usize,

    /// 待显示的视频帧数
    pub video_frames: usize,

    /// 待消费的音频帧数
    pub audio_frames: usize,
}

/// AV_TIME_BASE：FFmpeg 的微秒时间基
pub const AV_TIME_BASE: i64 = 1_000_000;

pub(crate) fn q2d(r: Rational) -> f64 {
    f64::from(r)
}
