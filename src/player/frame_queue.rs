use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::player::packet_queue::PacketQueue;

/// 视频帧队列容量
pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
/// 音频帧队列容量
pub const SAMPLE_QUEUE_SIZE: usize = 9;
/// 字幕帧队列容量
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;
/// 环形槽位数量上限
pub const FRAME_QUEUE_SIZE: usize = SUBPICTURE_QUEUE_SIZE;

/// 可进入帧队列的帧
pub trait QueuedFrame: Default + Send {
    fn serial(&self) -> i32;
    fn pos(&self) -> i64;
    /// 释放帧引用，槽位本身保留复用
    fn clear(&mut self);
}

struct RingState<T> {
    slots: Vec<T>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
    keep_last: bool,
    max_size: usize,
}

/// 解码帧环形队列
///
/// 槽位预分配并复用。keep_last 模式下最近消费的一帧保留在 rindex，
/// 供暂停重绘和 A/V 延迟计算使用；当前帧位于 (rindex + rindex_shown)。
/// 与一个包队列配对：包队列中止后所有阻塞操作立即返回。
pub struct FrameQueue<T: QueuedFrame> {
    state: Mutex<RingState<T>>,
    cond: Condvar,
    packets: Arc<PacketQueue>,
}

impl<T: QueuedFrame> FrameQueue<T> {
    pub fn new(packets: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let max_size = max_size.min(FRAME_QUEUE_SIZE);
        let mut slots = Vec::with_capacity(max_size);
        slots.resize_with(max_size, T::default);
        Self {
            state: Mutex::new(RingState {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
                keep_last,
                max_size,
            }),
            cond: Condvar::new(),
            packets,
        }
    }

    /// 锁住队列，拿到游标操作句柄
    pub fn lock(&self) -> FrameQueueGuard<'_, T> {
        FrameQueueGuard {
            state: self.state.lock(),
            cond: &self.cond,
        }
    }

    /// 唤醒所有等待者（配合包队列的 abort 使用）
    pub fn signal(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// 等待一个可写槽位；包队列中止时返回 None
    pub fn peek_writable(&self) -> Option<FrameQueueGuard<'_, T>> {
        let mut state = self.state.lock();
        while state.size >= state.max_size && !self.packets.is_aborted() {
            self.cond.wait(&mut state);
        }
        if self.packets.is_aborted() {
            return None;
        }
        Some(FrameQueueGuard {
            state,
            cond: &self.cond,
        })
    }

    /// 等待一个可读帧；包队列中止时返回 None
    pub fn peek_readable(&self) -> Option<FrameQueueGuard<'_, T>> {
        let mut state = self.state.lock();
        while state.size - state.rindex_shown == 0 && !self.packets.is_aborted() {
            self.cond.wait(&mut state);
        }
        if self.packets.is_aborted() {
            return None;
        }
        Some(FrameQueueGuard {
            state,
            cond: &self.cond,
        })
    }

    /// 尚未消费的帧数
    pub fn remaining(&self) -> usize {
        let state = self.state.lock();
        state.size - state.rindex_shown
    }

    pub fn rindex_shown(&self) -> bool {
        self.state.lock().rindex_shown != 0
    }

    /// 最近显示帧的文件字节位置（仍属于当前代时有效，否则 -1）
    pub fn last_pos(&self) -> i64 {
        let state = self.state.lock();
        let frame = &state.slots[state.rindex];
        if state.rindex_shown != 0 && frame.serial() == self.packets.serial() {
            frame.pos()
        } else {
            -1
        }
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().size
    }
}

/// 持锁的游标句柄
pub struct FrameQueueGuard<'a, T: QueuedFrame> {
    state: MutexGuard<'a, RingState<T>>,
    cond: &'a Condvar,
}

impl<'a, T: QueuedFrame> FrameQueueGuard<'a, T> {
    /// 当前待显示帧
    pub fn peek(&self) -> &T {
        let i = (self.state.rindex + self.state.rindex_shown) % self.state.max_size;
        &self.state.slots[i]
    }

    /// 当前帧的下一帧
    pub fn peek_next(&self) -> &T {
        let i = (self.state.rindex + self.state.rindex_shown + 1) % self.state.max_size;
        &self.state.slots[i]
    }

    /// 最近消费（显示）的帧
    pub fn peek_last(&self) -> &T {
        &self.state.slots[self.state.rindex]
    }

    pub fn peek_last_mut(&mut self) -> &mut T {
        let i = self.state.rindex;
        &mut self.state.slots[i]
    }

    /// 写入槽位。只能在 peek_writable 返回的句柄上使用
    pub fn writable(&mut self) -> &mut T {
        let i = self.state.windex;
        &mut self.state.slots[i]
    }

    /// 提交写入槽位
    pub fn push(&mut self) {
        self.state.windex = (self.state.windex + 1) % self.state.max_size;
        self.state.size += 1;
        self.cond.notify_one();
    }

    /// 消费当前帧。keep_last 首次调用只做晋升，不释放槽位
    pub fn next(&mut self) {
        if self.state.keep_last && self.state.rindex_shown == 0 {
            self.state.rindex_shown = 1;
            return;
        }
        let i = self.state.rindex;
        self.state.slots[i].clear();
        self.state.rindex = (self.state.rindex + 1) % self.state.max_size;
        self.state.size -= 1;
        self.cond.notify_one();
    }

    pub fn remaining(&self) -> usize {
        self.state.size - self.state.rindex_shown
    }

    pub fn rindex_shown(&self) -> bool {
        self.state.rindex_shown != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct DummyFrame {
        value: i32,
        serial: i32,
        pos: i64,
        cleared: bool,
    }

    impl QueuedFrame for DummyFrame {
        fn serial(&self) -> i32 {
            self.serial
        }
        fn pos(&self) -> i64 {
            self.pos
        }
        fn clear(&mut self) {
            self.cleared = true;
            self.value = 0;
        }
    }

    fn started_packets() -> Arc<PacketQueue> {
        let q = Arc::new(PacketQueue::new());
        q.start();
        q
    }

    fn push_value(queue: &FrameQueue<DummyFrame>, value: i32, serial: i32) {
        let mut guard = queue.peek_writable().expect("writable");
        let slot = guard.writable();
        slot.value = value;
        slot.serial = serial;
        slot.cleared = false;
        guard.push();
    }

    #[test]
    fn test_keep_last_promotion() {
        let queue = FrameQueue::<DummyFrame>::new(started_packets(), 3, true);
        push_value(&queue, 1, 1);
        push_value(&queue, 2, 1);
        assert_eq!(queue.remaining(), 2);

        // 首次 next 只晋升 rindex_shown，size 不变
        {
            let mut g = queue.lock();
            assert_eq!(g.peek().value, 1);
            g.next();
            assert!(g.rindex_shown());
        }
        assert_eq!(queue.queued_count(), 2);
        assert_eq!(queue.remaining(), 1);

        // 之后的 next 释放上一帧并前进
        {
            let mut g = queue.lock();
            assert_eq!(g.peek_last().value, 1);
            assert_eq!(g.peek().value, 2);
            g.next();
            assert_eq!(g.peek_last().value, 2);
        }
        assert_eq!(queue.queued_count(), 1);
        assert_eq!(queue.remaining(), 0);
    }

    #[test]
    fn test_size_bounds() {
        let queue = FrameQueue::<DummyFrame>::new(started_packets(), 2, false);
        push_value(&queue, 1, 1);
        push_value(&queue, 2, 1);
        assert_eq!(queue.queued_count(), 2);

        // 队列满时 peek_writable 阻塞，消费一帧后恢复
        let queue = Arc::new(queue);
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                push_value(&queue, 3, 1);
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!producer.is_finished());
        {
            let mut g = queue.lock();
            g.next();
        }
        producer.join().unwrap();
        assert_eq!(queue.queued_count(), 2);
    }

    #[test]
    fn test_abort_unblocks_reader() {
        let packets = started_packets();
        let queue = Arc::new(FrameQueue::<DummyFrame>::new(packets.clone(), 3, true));
        let reader = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.peek_readable().is_none())
        };
        std::thread::sleep(Duration::from_millis(30));
        packets.abort();
        queue.signal();
        assert!(reader.join().unwrap());
    }

    #[test]
    fn test_last_pos_follows_serial() {
        let packets = started_packets();
        let serial = packets.serial();
        let queue = FrameQueue::<DummyFrame>::new(packets.clone(), 3, true);
        {
            let mut g = queue.peek_writable().unwrap();
            let slot = g.writable();
            slot.serial = serial;
            slot.pos = 4096;
            g.push();
        }
        // 尚未显示过任何帧
        assert_eq!(queue.last_pos(), -1);
        {
            let mut g = queue.lock();
            g.next();
        }
        assert_eq!(queue.last_pos(), 4096);

        // 换代后位置失效
        packets.flush();
        assert_eq!(queue.last_pos(), -1);
    }
}
