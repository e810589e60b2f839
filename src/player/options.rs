use ffmpeg_next::{color, format, ChannelLayout, Rational};

use crate::core::{AudioParams, AvSyncType, PlayerError, Result};

/// 音频设备协商结果：宿主确定的输出参数与硬件缓冲大小
pub struct AudioDeviceConfig {
    pub params: AudioParams,
    /// 设备回调一次消费的字节数（参与音频钟的延迟补偿）
    pub hardware_buffer_size: usize,
}

/// 音频协商回调：核心给出编解码器侧的布局与采样率建议，
/// 宿主返回设备实际接受的参数
pub type AudioMetaCallback =
    dyn Fn(&ChannelLayout, u32) -> Result<AudioDeviceConfig> + Send + Sync;

/// 视频元信息回调：(宽, 高, 采样宽高比)
pub type VideoMetaCallback = dyn Fn(u32, u32, Rational) -> Result<()> + Send + Sync;

/// 致命错误通知
pub type ErrorCallback = dyn Fn(&PlayerError) + Send + Sync;

/// 视频流选项
pub struct VideoStreamOptions {
    /// 强制使用的解码器名
    pub codec_name: Option<String>,
    pub codec_opts: Vec<(String, String)>,
    /// 用户滤镜链（filtergraph 语法）
    pub filters: Option<String>,
    /// 滤镜图线程数（0 = 自动）
    pub filter_nb_threads: i32,
    pub sws_opts: Vec<(String, String)>,
    /// 低分辨率解码档位
    pub lowres: i32,
    /// AV_CODEC_FLAG2_FAST
    pub fast: bool,
    /// 展示端支持的像素格式（空 = 不约束）
    pub pix_fmts: Vec<format::Pixel>,
    /// 展示端支持的色彩空间（空 = 不约束）
    pub color_spaces: Vec<color::Space>,
    pub autorotate: bool,
    /// 用 best_effort_timestamp 重排 PTS
    pub reorder_pts: bool,
    pub meta_cb: Option<Box<VideoMetaCallback>>,
}

impl Default for VideoStreamOptions {
    fn default() -> Self {
        Self {
            codec_name: None,
            codec_opts: Vec::new(),
            filters: None,
            filter_nb_threads: 0,
            sws_opts: Vec::new(),
            lowres: 0,
            fast: false,
            pix_fmts: Vec::new(),
            color_spaces: Vec::new(),
            autorotate: true,
            reorder_pts: true,
            meta_cb: None,
        }
    }
}

/// 音频流选项
pub struct AudioStreamOptions {
    pub codec_name: Option<String>,
    pub codec_opts: Vec<(String, String)>,
    pub filters: Option<String>,
    pub filter_nb_threads: i32,
    pub swr_opts: Vec<(String, String)>,
    pub lowres: i32,
    pub fast: bool,
    pub meta_cb: Option<Box<AudioMetaCallback>>,
}

impl Default for AudioStreamOptions {
    fn default() -> Self {
        Self {
            codec_name: None,
            codec_opts: Vec::new(),
            filters: None,
            filter_nb_threads: 0,
            swr_opts: Vec::new(),
            lowres: 0,
            fast: false,
            meta_cb: None,
        }
    }
}

/// 播放器选项
pub struct PlayerOptions {
    /// 跳过音频流选择
    pub audio_disable: bool,
    /// 允许时按文件字节偏移 seek（仅对时间戳可间断的容器生效）
    pub seek_by_bytes: bool,
    /// 播放起点（微秒）
    pub start_time: Option<i64>,
    /// 播放时长上限（微秒）
    pub duration: Option<i64>,
    /// 让解复用器生成缺失的 PTS
    pub genpts: bool,
    /// 播放完毕回到起点循环
    pub loop_playback: bool,
    /// 解码前探测流信息
    pub find_stream_info: bool,
    /// 音量 0..=max（update_volume 的 max 由调用方给定）
    pub audio_volume: i32,
    pub av_sync_type: AvSyncType,
    /// 在调用方线程驱动读循环，而不是另起解复用线程
    pub run_sync: bool,
    /// 传给解复用器的选项
    pub format_opts: Vec<(String, String)>,
    pub video: VideoStreamOptions,
    pub audio: AudioStreamOptions,
    pub on_error: Option<Box<ErrorCallback>>,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            audio_disable: false,
            seek_by_bytes: false,
            start_time: None,
            duration: None,
            genpts: false,
            loop_playback: false,
            find_stream_info: true,
            audio_volume: 100,
            av_sync_type: AvSyncType::AudioMaster,
            run_sync: false,
            format_opts: Vec::new(),
            video: VideoStreamOptions::default(),
            audio: AudioStreamOptions::default(),
            on_error: None,
        }
    }
}
