use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开媒体: {0}")]
    OpenError(String),

    #[error("没有可播放的流")]
    NoPlayableStream,

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("滤镜图错误: {0}")]
    FilterError(String),

    #[error("音频输出协商失败: {0}")]
    AudioError(String),

    #[error("Seek 失败: {0}")]
    SeekError(String),

    #[error("播放已中止")]
    Aborted,

    #[error("其他错误: {0}")]
    Other(String),
}

impl PlayerError {
    /// 是否为致命错误（致命错误会结束播放并通过 on_error 通知宿主）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PlayerError::SeekError(_) | PlayerError::Aborted)
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
