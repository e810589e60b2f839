//! ffplayer - 基于 FFmpeg 的音视频播放内核
//!
//! 从一个媒体 URL 持续读包，在独立线程上解码选中的音/视频流，
//! 用三个逻辑时钟（音频/视频/外部）做主从同步，并在正确的挂钟时刻
//! 把解码帧交给外部展示端。窗口渲染、音频设备与命令行都不在这里，
//! 宿主通过 [`player::Player`] 的取帧/取样接口和协商回调接入。

pub mod core;
pub mod player;

pub use crate::core::{
    AudioParams, AvSyncType, ChapterInfo, Clock, PlayerError, QueueStats, Result, SerialRef,
    SourceInfo,
};
pub use crate::player::{
    AudioDeviceConfig, AudioStreamOptions, DisplayFrame, Player, PlayerOptions, VideoStreamOptions,
};

pub use ffmpeg_next;
