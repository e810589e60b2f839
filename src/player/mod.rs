// 播放内核：包/帧队列、解码线程、滤镜流水线与同步调度

pub mod packet_queue;
pub mod frame_queue;
pub mod frame;
pub mod decoder;
pub mod options;
pub mod manager;

pub(crate) mod filters;
pub(crate) mod pipeline;
pub(crate) mod sync;

pub use decoder::{Decoded, Decoder, DecoderDriver, MediaDecoder};
pub use frame::{PictureFrame, SampleFrame};
pub use frame_queue::{FrameQueue, QueuedFrame, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE};
pub use manager::{DisplayFrame, Player};
pub use options::{
    AudioDeviceConfig, AudioMetaCallback, AudioStreamOptions, ErrorCallback, PlayerOptions,
    VideoMetaCallback, VideoStreamOptions,
};
pub use packet_queue::{Dequeued, PacketQueue};

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// 解复用线程的唤醒点：解码器在包队列吃空时敲它，
/// seek/切流请求也用它打断解复用线程的背压小睡
pub(crate) struct ReadWake {
    lock: Mutex<()>,
    cond: Condvar,
}

impl ReadWake {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        self.cond.notify_one();
    }

    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        let _ = self.cond.wait_for(&mut guard, timeout);
    }
}
