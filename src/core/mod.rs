// 核心数据结构和类型定义

pub mod types;
pub mod clock;
pub mod error;

pub use types::{AudioParams, AvSyncType, ChapterInfo, QueueStats, SourceInfo, AV_TIME_BASE};

pub use clock::*;
pub use error::*;
