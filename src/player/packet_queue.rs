use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use ffmpeg_next as ffmpeg;
use parking_lot::{Condvar, Mutex};

use crate::core::{PlayerError, Result, SerialRef};

/// 入队时打上序列号的压缩包
struct QueuedPacket {
    packet: ffmpeg::Packet,
    serial: i32,
}

struct QueueState {
    packets: VecDeque<QueuedPacket>,
    size: usize,
    duration: i64,
    serial: i32,
    aborted: bool,
}

/// 取包结果
pub enum Dequeued {
    /// 一个包及其入队时的序列号
    Packet(ffmpeg::Packet, i32),
    /// 队列为空（仅非阻塞模式）
    Empty,
    /// 队列已中止
    Aborted,
}

/// 压缩包队列
///
/// 解复用线程是唯一生产者，对应的解码线程是唯一消费者。
/// flush/start 使序列号 +1，消费端据此丢弃换代前的在途数据。
/// 新建的队列处于中止状态，必须先 start 才能入队。
pub struct PacketQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    serial: SerialRef,
    aborted: AtomicBool,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                packets: VecDeque::new(),
                size: 0,
                duration: 0,
                serial: 0,
                aborted: true,
            }),
            cond: Condvar::new(),
            serial: SerialRef::new(0),
            aborted: AtomicBool::new(true),
        }
    }

    /// 当前序列号
    pub fn serial(&self) -> i32 {
        self.serial.get()
    }

    /// 序列号只读视图，供配对时钟做过期判定
    pub fn serial_ref(&self) -> SerialRef {
        self.serial.clone()
    }

    pub fn size_bytes(&self) -> usize {
        self.state.lock().size
    }

    pub fn packet_count(&self) -> usize {
        self.state.lock().packets.len()
    }

    /// 队列内所有包的时长之和（流时间基单位）
    pub fn duration(&self) -> i64 {
        self.state.lock().duration
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// 入队（转移包的所有权）。队列中止时丢弃并返回错误
    pub fn put(&self, packet: ffmpeg::Packet) -> Result<()> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(PlayerError::Aborted);
        }
        state.size += packet.size() + std::mem::size_of::<QueuedPacket>();
        state.duration += packet.duration();
        let serial = state.serial;
        state.packets.push_back(QueuedPacket { packet, serial });
        self.cond.notify_one();
        Ok(())
    }

    /// 入队一个空包，通知该流的解码器进入排空（EOF）
    pub fn put_null(&self, stream_index: usize) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        packet.set_stream(stream_index);
        self.put(packet)
    }

    /// 取包。block 为 true 时等待数据或中止
    pub fn get(&self, block: bool) -> Dequeued {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Dequeued::Aborted;
            }
            if let Some(entry) = state.packets.pop_front() {
                state.size -= entry.packet.size() + std::mem::size_of::<QueuedPacket>();
                state.duration -= entry.packet.duration();
                return Dequeued::Packet(entry.packet, entry.serial);
            }
            if !block {
                return Dequeued::Empty;
            }
            self.cond.wait(&mut state);
        }
    }

    /// 丢弃全部包并使序列号 +1
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.packets.clear();
        state.size = 0;
        state.duration = 0;
        state.serial += 1;
        self.serial.set(state.serial);
    }

    /// 解除中止状态，序列号 +1
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.aborted = false;
        state.serial += 1;
        self.aborted.store(false, Ordering::SeqCst);
        self.serial.set(state.serial);
    }

    /// 中止：唤醒所有等待者，后续入队/取包立即失败
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.aborted.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn make_packet(size: usize, duration: i64) -> ffmpeg::Packet {
        let mut packet = ffmpeg::Packet::copy(&vec![0u8; size]);
        packet.set_duration(duration);
        packet
    }

    #[test]
    fn test_newborn_queue_rejects_put() {
        let queue = PacketQueue::new();
        assert!(queue.is_aborted());
        assert!(queue.put(make_packet(16, 1)).is_err());
        queue.start();
        assert!(queue.put(make_packet(16, 1)).is_ok());
    }

    #[test]
    fn test_aggregates_are_exact_sums() {
        let queue = PacketQueue::new();
        queue.start();
        queue.put(make_packet(100, 10)).unwrap();
        queue.put(make_packet(50, 5)).unwrap();
        assert_eq!(queue.packet_count(), 2);
        assert_eq!(queue.duration(), 15);
        let overhead = 2 * std::mem::size_of::<QueuedPacket>();
        assert_eq!(queue.size_bytes(), 150 + overhead);

        match queue.get(false) {
            Dequeued::Packet(p, serial) => {
                assert_eq!(p.size(), 100);
                assert_eq!(serial, queue.serial());
            }
            _ => panic!("expected packet"),
        }
        assert_eq!(queue.packet_count(), 1);
        assert_eq!(queue.duration(), 5);
    }

    #[test]
    fn test_flush_bumps_serial_and_empties() {
        let queue = PacketQueue::new();
        queue.start();
        let before = queue.serial();
        queue.put(make_packet(8, 1)).unwrap();
        queue.flush();
        assert_eq!(queue.serial(), before + 1);
        assert_eq!(queue.packet_count(), 0);
        assert_eq!(queue.size_bytes(), 0);
        assert_eq!(queue.duration(), 0);

        // flush 后入队的包带新序列号
        queue.put(make_packet(8, 1)).unwrap();
        match queue.get(false) {
            Dequeued::Packet(_, serial) => assert_eq!(serial, before + 1),
            _ => panic!("expected packet"),
        }
    }

    #[test]
    fn test_nonblocking_get_on_empty() {
        let queue = PacketQueue::new();
        queue.start();
        assert!(matches!(queue.get(false), Dequeued::Empty));
    }

    #[test]
    fn test_abort_unblocks_waiter() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || matches!(queue.get(true), Dequeued::Aborted))
        };
        std::thread::sleep(Duration::from_millis(30));
        queue.abort();
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_blocking_get_receives_packet() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || match queue.get(true) {
                Dequeued::Packet(p, _) => p.size(),
                _ => 0,
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.put(make_packet(32, 1)).unwrap();
        assert_eq!(consumer.join().unwrap(), 32);
    }

    #[test]
    fn test_null_packet_roundtrip() {
        let queue = PacketQueue::new();
        queue.start();
        queue.put_null(3).unwrap();
        match queue.get(false) {
            Dequeued::Packet(p, _) => {
                assert_eq!(p.stream(), 3);
                assert_eq!(p.size(), 0);
            }
            _ => panic!("expected null packet"),
        }
    }
}
