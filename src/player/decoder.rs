use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, ffi, Rational, Rescale};
use log::{debug, error};

use crate::core::{PlayerError, Result};
use crate::player::frame_queue::{FrameQueue, QueuedFrame};
use crate::player::packet_queue::{Dequeued, PacketQueue};
use crate::player::ReadWake;

/// 打开的解码器（按媒体类型分派 send/receive）
pub enum MediaDecoder {
    Video(codec::decoder::Video),
    Audio(codec::decoder::Audio),
}

/// 解码线程与播放器共享的状态
pub struct DecoderState {
    packet_serial: AtomicI32,
    finished: AtomicI32,
}

impl DecoderState {
    fn new() -> Self {
        Self {
            packet_serial: AtomicI32::new(-1),
            finished: AtomicI32::new(0),
        }
    }

    /// 最近取包的序列号
    pub fn packet_serial(&self) -> i32 {
        self.packet_serial.load(Ordering::SeqCst)
    }

    /// 观察到 EOF 时的序列号（0 表示尚未结束）
    pub fn finished_serial(&self) -> i32 {
        self.finished.load(Ordering::SeqCst)
    }
}

/// 一次 decode 调用的结果
pub enum Decoded {
    /// 产出一帧
    Frame,
    /// 当前代已排空（EOF）
    Finished,
    /// 队列中止，工作线程应退出
    Aborted,
}

/// 解码驱动，归解码工作线程所有
///
/// 在 send/receive 两个阶段之间协作推进：接收端排空到 EAGAIN，
/// 再从包队列拉取当前代的包送入编解码器。跨代（seek 后）时
/// 清洗编解码器缓冲并丢弃旧包。
pub struct DecoderDriver {
    codec: MediaDecoder,
    queue: Arc<PacketQueue>,
    state: Arc<DecoderState>,
    read_wake: Arc<ReadWake>,

    pending: Option<ffmpeg::Packet>,
    packet_serial: i32,

    start_pts: Option<i64>,
    start_pts_tb: Rational,
    next_pts: Option<i64>,
    next_pts_tb: Rational,

    reorder_pts: bool,
    /// 流时间基（用于音频 PTS 换算）
    pkt_time_base: Rational,
}

impl DecoderDriver {
    pub fn new(
        codec: MediaDecoder,
        queue: Arc<PacketQueue>,
        read_wake: Arc<ReadWake>,
        reorder_pts: bool,
        pkt_time_base: Rational,
    ) -> Self {
        Self {
            codec,
            queue,
            state: Arc::new(DecoderState::new()),
            read_wake,
            pending: None,
            packet_serial: -1,
            start_pts: None,
            start_pts_tb: Rational::new(0, 1),
            next_pts: None,
            next_pts_tb: Rational::new(0, 1),
            reorder_pts,
            pkt_time_base,
        }
    }

    /// 无时间戳容器用流起始时间做 PTS 种子
    pub fn set_start_pts(&mut self, pts: i64, time_base: Rational) {
        self.start_pts = Some(pts);
        self.start_pts_tb = time_base;
    }

    pub fn packet_serial(&self) -> i32 {
        self.packet_serial
    }

    /// 标记当前代已结束（滤镜下游观察到 EOF 时也会调用）
    pub fn set_finished(&mut self) {
        self.state.finished.store(self.packet_serial, Ordering::SeqCst);
    }

    pub(crate) fn state(&self) -> Arc<DecoderState> {
        self.state.clone()
    }

    pub(crate) fn queue(&self) -> Arc<PacketQueue> {
        self.queue.clone()
    }

    /// 解一帧视频
    pub fn decode_video(&mut self, frame: &mut ffmpeg::util::frame::Video) -> Result<Decoded> {
        loop {
            if self.queue.serial() == self.packet_serial {
                loop {
                    if self.queue.is_aborted() {
                        return Ok(Decoded::Aborted);
                    }
                    let received = match &mut self.codec {
                        MediaDecoder::Video(d) => d.receive_frame(frame),
                        MediaDecoder::Audio(_) => {
                            return Err(PlayerError::DecodeError("音频解码器收到视频请求".into()))
                        }
                    };
                    match received {
                        Ok(()) => {
                            let pts = if self.reorder_pts {
                                frame.timestamp()
                            } else {
                                // best_effort 之外的回退：包的 DTS
                                let dts = unsafe { (*frame.as_ptr()).pkt_dts };
                                (dts != ffi::AV_NOPTS_VALUE).then_some(dts)
                            };
                            frame.set_pts(pts);
                            return Ok(Decoded::Frame);
                        }
                        Err(ffmpeg::Error::Eof) => {
                            self.set_finished();
                            self.flush_codec();
                            return Ok(Decoded::Finished);
                        }
                        Err(ffmpeg::Error::Other { errno: 11 }) => break, // EAGAIN
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            match self.next_packet() {
                Some(packet) => self.submit(packet)?,
                None => return Ok(Decoded::Aborted),
            }
        }
    }

    /// 解一帧音频。PTS 统一换算到 1/sample_rate 时间基，
    /// 缺失时用 next_pts 顺延补齐
    pub fn decode_audio(&mut self, frame: &mut ffmpeg::util::frame::Audio) -> Result<Decoded> {
        loop {
            if self.queue.serial() == self.packet_serial {
                loop {
                    if self.queue.is_aborted() {
                        return Ok(Decoded::Aborted);
                    }
                    let received = match &mut self.codec {
                        MediaDecoder::Audio(d) => d.receive_frame(frame),
                        MediaDecoder::Video(_) => {
                            return Err(PlayerError::DecodeError("视频解码器收到音频请求".into()))
                        }
                    };
                    match received {
                        Ok(()) => {
                            let tb = Rational::new(1, frame.rate() as i32);
                            if let Some(pts) = frame.pts() {
                                frame.set_pts(Some(pts.rescale(self.pkt_time_base, tb)));
                            } else if let Some(next) = self.next_pts {
                                frame.set_pts(Some(next.rescale(self.next_pts_tb, tb)));
                            }
                            if let Some(pts) = frame.pts() {
                                self.next_pts = Some(pts + frame.samples() as i64);
                                self.next_pts_tb = tb;
                            }
                            return Ok(Decoded::Frame);
                        }
                        Err(ffmpeg::Error::Eof) => {
                            self.set_finished();
                            self.flush_codec();
                            return Ok(Decoded::Finished);
                        }
                        Err(ffmpeg::Error::Other { errno: 11 }) => break, // EAGAIN
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            match self.next_packet() {
                Some(packet) => self.submit(packet)?,
                None => return Ok(Decoded::Aborted),
            }
        }
    }

    /// 拉取一个属于当前代的包；队列中止返回 None
    fn next_packet(&mut self) -> Option<ffmpeg::Packet> {
        loop {
            if self.queue.packet_count() == 0 {
                // 队列空了，叫醒解复用线程
                self.read_wake.signal();
            }
            let packet = if let Some(pending) = self.pending.take() {
                pending
            } else {
                let old_serial = self.packet_serial;
                match self.queue.get(true) {
                    Dequeued::Packet(packet, serial) => {
                        self.packet_serial = serial;
                        self.state.packet_serial.store(serial, Ordering::SeqCst);
                        if old_serial != serial {
                            debug!("包序列号 {} -> {}，清洗解码器缓冲", old_serial, serial);
                            self.flush_codec();
                            self.state.finished.store(0, Ordering::SeqCst);
                            self.next_pts = self.start_pts;
                            self.next_pts_tb = self.start_pts_tb;
                        }
                        packet
                    }
                    Dequeued::Empty | Dequeued::Aborted => return None,
                }
            };
            if self.queue.serial() == self.packet_serial {
                return Some(packet);
            }
            // 换代前的旧包直接丢弃
        }
    }

    /// 送包。receive 与 send 同时 EAGAIN 属于 API 违例，包暂存下轮重试
    fn submit(&mut self, mut packet: ffmpeg::Packet) -> Result<()> {
        attach_packet_pos(&mut packet)?;
        let sent = match &mut self.codec {
            MediaDecoder::Video(d) => d.send_packet(&packet),
            MediaDecoder::Audio(d) => d.send_packet(&packet),
        };
        if matches!(sent, Err(ffmpeg::Error::Other { errno: 11 })) {
            // EAGAIN
            error!("receive_frame 与 send_packet 同时返回 EAGAIN（API 违例）");
            self.pending = Some(packet);
        }
        Ok(())
    }

    fn flush_codec(&mut self) {
        match &mut self.codec {
            MediaDecoder::Video(d) => d.flush(),
            MediaDecoder::Audio(d) => d.flush(),
        }
    }
}

/// 解码线程句柄（播放器一侧）
pub struct Decoder {
    state: Arc<DecoderState>,
    queue: Arc<PacketQueue>,
    thread: Option<JoinHandle<()>>,
}

impl Decoder {
    /// 启动包队列并拉起解码工作线程
    pub fn spawn<F>(name: &str, driver: DecoderDriver, body: F) -> Result<Self>
    where
        F: FnOnce(DecoderDriver) + Send + 'static,
    {
        let state = driver.state();
        let queue = driver.queue();
        queue.start();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(driver))?;
        Ok(Self {
            state,
            queue,
            thread: Some(thread),
        })
    }

    pub fn packet_serial(&self) -> i32 {
        self.state.packet_serial()
    }

    pub fn finished_serial(&self) -> i32 {
        self.state.finished_serial()
    }

    /// 中止并回收：解除一切阻塞、join 工作线程、清空包队列
    pub fn abort<T: QueuedFrame>(&mut self, frames: &FrameQueue<T>) {
        self.queue.abort();
        frames.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.queue.flush();
    }
}

/// 给有负载的包挂上文件位置标记，随 copy_opaque 透传到输出帧
pub(crate) fn attach_packet_pos(packet: &mut ffmpeg::Packet) -> Result<()> {
    unsafe {
        let raw = packet.as_mut_ptr();
        if (*raw).buf.is_null() || !(*raw).opaque_ref.is_null() {
            return Ok(());
        }
        let buf = ffi::av_buffer_allocz(std::mem::size_of::<i64>());
        if buf.is_null() {
            return Err(PlayerError::Other("av_buffer_allocz 失败".into()));
        }
        std::ptr::write_unaligned((*buf).data as *mut i64, (*raw).pos);
        (*raw).opaque_ref = buf;
    }
    Ok(())
}

/// 读取帧上透传的文件位置标记（无标记为 -1）
pub(crate) fn frame_packet_pos(frame: &ffmpeg::util::frame::Frame) -> i64 {
    unsafe {
        let raw = frame.as_ptr();
        if (*raw).opaque_ref.is_null() {
            -1
        } else {
            std::ptr::read_unaligned((*(*raw).opaque_ref).data as *const i64)
        }
    }
}
