use std::ffi::CString;
use std::ops::{Deref, DerefMut};
use std::os::raw::{c_int, c_void};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, ffi, format, media, software, ChannelLayout, Rational, Rescale};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::core::clock::{instant_seconds, relative_seconds};
use crate::core::types::q2d;
use crate::core::{
    AudioParams, AvSyncType, ChapterInfo, Clock, PlayerError, QueueStats, Result, SourceInfo,
    AV_TIME_BASE,
};
use crate::player::decoder::{Decoder, DecoderDriver, MediaDecoder};
use crate::player::filters::{configure_audio_graph, matrix_from_bytes};
use crate::player::frame::{PictureFrame, SampleFrame};
use crate::player::frame_queue::{FrameQueue, FrameQueueGuard, SAMPLE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE};
use crate::player::options::{AudioDeviceConfig, PlayerOptions};
use crate::player::packet_queue::PacketQueue;
use crate::player::pipeline::{audio_worker, normalized_layout, video_worker, AudioPipeline, VideoPipeline};
use crate::player::sync::{
    adapted_external_speed, compute_target_delay, frame_duration, packet_in_play_range,
    stepped_volume, AudioDrift, AV_NOSYNC_THRESHOLD, AV_SYNC_THRESHOLD_MAX, MAX_QUEUE_SIZE,
    MIN_FRAMES,
};
use crate::player::ReadWake;

fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}

/// 待处理的 seek 请求
struct SeekRequest {
    pos: i64,
    rel: i64,
    by_bytes: bool,
}

struct DecoderHandles {
    audio: Option<Decoder>,
    video: Option<Decoder>,
}

struct SchedulerState {
    frame_timer: f64,
}

/// SwrContext 本身未标记 Send，但重采样器只在音频取数路径（单线程）中使用
struct Resampler(software::resampling::Context);

unsafe impl Send for Resampler {}

/// 音频消费侧状态（目标参数、重采样器、漂移校正、音频钟种子）
pub(crate) struct AudioState {
    pub target: Option<AudioParams>,
    /// 重采样器当前的输入参数
    pub source: Option<AudioParams>,
    pub hw_buf_size: usize,
    /// 最近一帧消费完后的音频钟值（帧 pts + 帧时长）
    pub clock_value: f64,
    pub clock_serial: i32,
    pub drift: AudioDrift,
    swr: Option<Resampler>,
}

impl AudioState {
    fn new() -> Self {
        Self {
            target: None,
            source: None,
            hw_buf_size: 0,
            clock_value: f64::NAN,
            clock_serial: -1,
            drift: AudioDrift::new(0.1),
            swr: None,
        }
    }
}

/// 播放器内部共享体。解复用线程、解码线程与调用方线程共同持有
pub(crate) struct PlayerCore {
    pub(crate) opts: PlayerOptions,

    pub(crate) abort_request: AtomicBool,
    pub(crate) paused: AtomicBool,
    last_paused: AtomicBool,
    pub(crate) step: AtomicBool,
    pub(crate) force_refresh: AtomicBool,
    eof: AtomicBool,
    queue_attachments_req: AtomicBool,
    /// av_read_pause 是否被输入协议支持
    read_pause_ok: AtomicBool,
    /// 打开后实际生效的按字节 seek 开关
    seek_by_bytes: AtomicBool,
    pub(crate) realtime: AtomicBool,

    seek: Mutex<Option<SeekRequest>>,
    cycle: Mutex<Option<media::Type>>,
    last_seek_pos: AtomicI64,
    /// 最近读到的包的文件位置（按字节 seek 的兜底基准）
    last_read_pos: AtomicI64,
    audio_volume: AtomicI32,

    pub(crate) video_stream_index: AtomicI32,
    pub(crate) audio_stream_index: AtomicI32,
    last_video_stream_index: AtomicI32,
    last_audio_stream_index: AtomicI32,

    pub(crate) video_packets: Arc<PacketQueue>,
    pub(crate) audio_packets: Arc<PacketQueue>,
    pub(crate) picture_queue: FrameQueue<PictureFrame>,
    pub(crate) sample_queue: FrameQueue<SampleFrame>,

    pub(crate) video_clock: Clock,
    pub(crate) audio_clock: Clock,
    pub(crate) external_clock: Clock,

    pub(crate) read_wake: Arc<ReadWake>,
    decoders: Mutex<DecoderHandles>,
    sched: Mutex<SchedulerState>,
    pub(crate) audio: Mutex<AudioState>,
    source: RwLock<Option<SourceInfo>>,
}

impl PlayerCore {
    /// 主钟选择，带回退：VIDEO 无视频流时退到 AUDIO，AUDIO 无音频流时退到 EXTERNAL
    pub(crate) fn master_sync_type(&self) -> AvSyncType {
        match self.opts.av_sync_type {
            AvSyncType::VideoMaster => {
                if self.video_stream_index.load(Ordering::SeqCst) >= 0 {
                    AvSyncType::VideoMaster
                } else {
                    AvSyncType::AudioMaster
                }
            }
            AvSyncType::AudioMaster => {
                if self.audio_stream_index.load(Ordering::SeqCst) >= 0 {
                    AvSyncType::AudioMaster
                } else {
                    AvSyncType::ExternalClock
                }
            }
            AvSyncType::ExternalClock => AvSyncType::ExternalClock,
        }
    }

    pub(crate) fn master_clock(&self) -> f64 {
        match self.master_sync_type() {
            AvSyncType::VideoMaster => self.video_clock.get(),
            AvSyncType::AudioMaster => self.audio_clock.get(),
            AvSyncType::ExternalClock => self.external_clock.get(),
        }
    }

    fn max_frame_duration(&self) -> f64 {
        self.source
            .read()
            .as_ref()
            .map(|s| s.max_frame_duration)
            .unwrap_or(3600.0)
    }

    /// 实时源 + 外部主钟：按包队列存量微调外部时钟速率
    fn check_external_clock_speed(&self) {
        let video_packets = (self.video_stream_index.load(Ordering::SeqCst) >= 0)
            .then(|| self.video_packets.packet_count());
        let audio_packets = (self.audio_stream_index.load(Ordering::SeqCst) >= 0)
            .then(|| self.audio_packets.packet_count());
        let speed = self.external_clock.speed();
        self.external_clock
            .set_speed(adapted_external_speed(speed, video_packets, audio_packets));
    }

    fn stream_toggle_pause(&self) {
        if self.paused.load(Ordering::SeqCst) {
            {
                let mut sched = self.sched.lock();
                sched.frame_timer += relative_seconds() - self.video_clock.last_updated();
            }
            if self.read_pause_ok.load(Ordering::SeqCst) {
                self.video_clock.set_paused(false);
            }
            self.video_clock
                .set(self.video_clock.get(), self.video_clock.serial());
        }
        self.external_clock
            .set(self.external_clock.get(), self.external_clock.serial());
        let paused = !self.paused.load(Ordering::SeqCst);
        self.paused.store(paused, Ordering::SeqCst);
        self.audio_clock.set_paused(paused);
        self.video_clock.set_paused(paused);
        self.external_clock.set_paused(paused);
    }

    fn step_to_next_frame(&self) {
        if self.paused.load(Ordering::SeqCst) {
            self.stream_toggle_pause();
        }
        self.step.store(true, Ordering::SeqCst);
    }

    /// 登记 seek 请求（未消费前的重复请求被合并）
    fn stream_seek(&self, pos: i64, rel: i64, by_bytes: bool) {
        let mut seek = self.seek.lock();
        if seek.is_none() {
            self.last_seek_pos.store(pos, Ordering::SeqCst);
            *seek = Some(SeekRequest { pos, rel, by_bytes });
            self.read_wake.signal();
        }
    }
}

/// 待展示的视频帧（持有帧队列锁）
pub struct DisplayFrame<'a> {
    guard: FrameQueueGuard<'a, PictureFrame>,
}

impl Deref for DisplayFrame<'_> {
    type Target = PictureFrame;

    fn deref(&self) -> &PictureFrame {
        self.guard.peek_last()
    }
}

impl DerefMut for DisplayFrame<'_> {
    fn deref_mut(&mut self) -> &mut PictureFrame {
        self.guard.peek_last_mut()
    }
}

/// 播放器：解复用 + 双解码流水线 + 三时钟同步
pub struct Player {
    core: Arc<PlayerCore>,
    read_thread: Option<thread::JoinHandle<()>>,
    opened: bool,
    closed: bool,
}

impl Player {
    pub fn new(opts: PlayerOptions) -> Result<Self> {
        ffmpeg::init()?;
        ffmpeg::format::network::init();

        let video_packets = Arc::new(PacketQueue::new());
        let audio_packets = Arc::new(PacketQueue::new());
        let audio_volume = opts.audio_volume;
        let core = Arc::new(PlayerCore {
            video_clock: Clock::new(video_packets.serial_ref()),
            audio_clock: Clock::new(audio_packets.serial_ref()),
            external_clock: Clock::detached(),
            picture_queue: FrameQueue::new(video_packets.clone(), VIDEO_PICTURE_QUEUE_SIZE, true),
            sample_queue: FrameQueue::new(audio_packets.clone(), SAMPLE_QUEUE_SIZE, true),
            video_packets,
            audio_packets,
            opts,
            abort_request: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            last_paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            queue_attachments_req: AtomicBool::new(false),
            read_pause_ok: AtomicBool::new(true),
            seek_by_bytes: AtomicBool::new(false),
            realtime: AtomicBool::new(false),
            seek: Mutex::new(None),
            cycle: Mutex::new(None),
            last_seek_pos: AtomicI64::new(0),
            last_read_pos: AtomicI64::new(-1),
            audio_volume: AtomicI32::new(audio_volume),
            video_stream_index: AtomicI32::new(-1),
            audio_stream_index: AtomicI32::new(-1),
            last_video_stream_index: AtomicI32::new(-1),
            last_audio_stream_index: AtomicI32::new(-1),
            read_wake: Arc::new(ReadWake::new()),
            decoders: Mutex::new(DecoderHandles {
                audio: None,
                video: None,
            }),
            sched: Mutex::new(SchedulerState { frame_timer: 0.0 }),
            audio: Mutex::new(AudioState::new()),
            source: RwLock::new(None),
        });
        Ok(Self {
            core,
            read_thread: None,
            opened: false,
            closed: false,
        })
    }

    /// 打开媒体并启动解复用。run_sync 选项下在当前线程驱动读循环直到结束
    pub fn open(&mut self, url: &str, input_format: Option<&str>) -> Result<()> {
        if self.opened {
            return Err(PlayerError::Other("播放器已打开".into()));
        }
        self.opened = true;
        info!("{} 🎬 打开媒体: {}", log_ctx(), url);
        if self.core.opts.run_sync {
            return read_loop(&self.core, url, input_format);
        }
        let core = self.core.clone();
        let url = url.to_string();
        let hint = input_format.map(|s| s.to_string());
        self.read_thread = Some(
            thread::Builder::new()
                .name("demuxer".to_string())
                .spawn(move || {
                    let _ = read_loop(&core, &url, hint.as_deref());
                })?,
        );
        Ok(())
    }

    /// 关闭：中止所有线程并 join，清空队列
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("{} 🛑 关闭播放器", log_ctx());
        self.core.abort_request.store(true, Ordering::SeqCst);
        // 让解复用线程从 timed wait 里尽快出来
        self.core.video_packets.abort();
        self.core.audio_packets.abort();
        self.core.read_wake.signal();
        if let Some(handle) = self.read_thread.take() {
            let _ = handle.join();
        }
        close_stream(&self.core, media::Type::Audio);
        close_stream(&self.core, media::Type::Video);
        self.core.video_packets.flush();
        self.core.audio_packets.flush();
        info!("{} ✅ 播放器已关闭", log_ctx());
    }

    // ---------- 播放控制 ----------

    pub fn toggle_pause(&self) {
        self.core.stream_toggle_pause();
        self.core.step.store(false, Ordering::SeqCst);
    }

    pub fn step_to_next_frame(&self) {
        self.core.step_to_next_frame();
    }

    /// 相对 seek（秒）。按字节 seek 生效时换算为文件偏移
    pub fn seek(&self, incr: f64) {
        let core = &self.core;
        if core.seek_by_bytes.load(Ordering::SeqCst) {
            // 基准位置：优先取最近显示帧的文件位置，都拿不到再退到最近读包位置
            let mut pos = -1.0f64;
            if pos < 0.0 && core.video_stream_index.load(Ordering::SeqCst) >= 0 {
                pos = core.picture_queue.last_pos() as f64;
            }
            if pos < 0.0 && core.audio_stream_index.load(Ordering::SeqCst) >= 0 {
                pos = core.sample_queue.last_pos() as f64;
            }
            if pos < 0.0 {
                pos = core.last_read_pos.load(Ordering::SeqCst) as f64;
            }
            let bit_rate = core
                .source
                .read()
                .as_ref()
                .map(|s| s.bit_rate)
                .unwrap_or(0);
            let incr_bytes = if bit_rate != 0 {
                incr * bit_rate as f64 / 8.0
            } else {
                incr * 180000.0
            };
            core.stream_seek((pos + incr_bytes) as i64, incr_bytes as i64, true);
        } else {
            let mut pos = core.master_clock();
            if pos.is_nan() {
                pos = core.last_seek_pos.load(Ordering::SeqCst) as f64 / AV_TIME_BASE as f64;
            }
            pos += incr;
            if let Some(start) = core.source.read().as_ref().and_then(|s| s.start_time) {
                let start_seconds = start as f64 / AV_TIME_BASE as f64;
                if pos < start_seconds {
                    pos = start_seconds;
                }
            }
            core.stream_seek(
                (pos * AV_TIME_BASE as f64) as i64,
                (incr * AV_TIME_BASE as f64) as i64,
                false,
            );
        }
    }

    /// 跳到上一/下一章节
    pub fn seek_chapter(&self, incr: i32) {
        let core = &self.core;
        let pos = (core.master_clock() * AV_TIME_BASE as f64) as i64;
        let chapters: Vec<ChapterInfo> = match core.source.read().as_ref() {
            Some(s) if !s.chapters.is_empty() => s.chapters.clone(),
            _ => return,
        };
        let time_base_q = Rational::new(1, AV_TIME_BASE as i32);
        let mut i = chapters.len() as i32;
        for (index, chapter) in chapters.iter().enumerate() {
            let cmp = unsafe {
                ffi::av_compare_ts(pos, time_base_q.into(), chapter.start, chapter.time_base.into())
            };
            if cmp < 0 {
                i = index as i32 - 1;
                break;
            }
        }
        i += incr;
        i = i.max(0);
        if i as usize >= chapters.len() {
            return;
        }
        info!("{} Seek 到章节 {}", log_ctx(), i);
        let chapter = &chapters[i as usize];
        core.stream_seek(chapter.start.rescale(chapter.time_base, time_base_q), 0, false);
    }

    /// 切换到下一条同类型的流（由解复用线程执行实际开关）
    pub fn cycle_channel(&self, kind: media::Type) {
        *self.core.cycle.lock() = Some(kind);
        self.core.read_wake.signal();
    }

    /// 音量按对数刻度步进
    pub fn update_volume(&self, max_volume: i32, sign: i32, step: f64) {
        let current = self.core.audio_volume.load(Ordering::SeqCst);
        self.core
            .audio_volume
            .store(stepped_volume(current, max_volume, sign, step), Ordering::SeqCst);
    }

    // ---------- 消费端接口 ----------

    /// 视频帧调度。返回应当展示的帧，或 None（保持当前画面）。
    /// remaining_time 双向传递：告知展示端下次回调前还能睡多久
    pub fn acquire_video_frame(&self, remaining_time: &mut f64) -> Option<DisplayFrame<'_>> {
        let core = &self.core;
        if !core.paused.load(Ordering::SeqCst)
            && core.master_sync_type() == AvSyncType::ExternalClock
            && core.realtime.load(Ordering::SeqCst)
        {
            core.check_external_clock_speed();
        }
        if core.video_stream_index.load(Ordering::SeqCst) < 0 {
            core.force_refresh.store(false, Ordering::SeqCst);
            return None;
        }

        let mut toggle_pause_after = false;
        loop {
            let mut guard = core.picture_queue.lock();
            if guard.remaining() == 0 {
                break;
            }
            let queue_serial = core.video_packets.serial();
            if guard.peek().serial != queue_serial {
                // 换代残留帧，直接丢弃
                guard.next();
                continue;
            }
            if guard.peek_last().serial != guard.peek().serial {
                // seek 边界：重置帧定时器
                core.sched.lock().frame_timer = relative_seconds();
            }
            if core.paused.load(Ordering::SeqCst) {
                break;
            }

            let max_frame_duration = core.max_frame_duration();
            let last_duration = frame_duration(guard.peek_last(), guard.peek(), max_frame_duration);
            let diff = if core.master_sync_type() != AvSyncType::VideoMaster {
                core.video_clock.get() - core.master_clock()
            } else {
                f64::NAN
            };
            let delay = compute_target_delay(last_duration, diff, max_frame_duration);

            let time = relative_seconds();
            let frame_timer = core.sched.lock().frame_timer;
            if time < frame_timer + delay {
                *remaining_time = (frame_timer + delay - time).min(*remaining_time);
                break;
            }
            {
                let mut sched = core.sched.lock();
                sched.frame_timer += delay;
                if delay > 0.0 && time - sched.frame_timer > AV_SYNC_THRESHOLD_MAX {
                    sched.frame_timer = time;
                }
            }
            // 持帧队列锁发布视频钟
            let frame_pts = guard.peek().pts;
            let frame_serial = guard.peek().serial;
            if !frame_pts.is_nan() {
                core.video_clock.set(frame_pts, frame_serial);
                core.external_clock
                    .sync_to_slave(&core.video_clock, AV_NOSYNC_THRESHOLD);
            }

            if guard.remaining() > 1 {
                let duration = frame_duration(guard.peek(), guard.peek_next(), max_frame_duration);
                if !core.step.load(Ordering::SeqCst)
                    && core.master_sync_type() != AvSyncType::VideoMaster
                    && time > core.sched.lock().frame_timer + duration
                {
                    // 已经落后于下一帧：丢掉当前帧
                    guard.next();
                    continue;
                }
            }
            guard.next();
            core.force_refresh.store(true, Ordering::SeqCst);
            if core.step.load(Ordering::SeqCst) && !core.paused.load(Ordering::SeqCst) {
                toggle_pause_after = true;
            }
            break;
        }
        if toggle_pause_after {
            core.stream_toggle_pause();
        }
        if core.force_refresh.load(Ordering::SeqCst) && core.picture_queue.rindex_shown() {
            return Some(DisplayFrame {
                guard: core.picture_queue.lock(),
            });
        }
        core.force_refresh.store(false, Ordering::SeqCst);
        None
    }

    /// 取一段重采样后的音频数据写入 out（S16 目标格式），返回字节数。
    /// 暂停或中止时返回 None
    pub fn acquire_audio_buf(&self, out: &mut Vec<u8>) -> Option<usize> {
        let core = &self.core;
        if core.paused.load(Ordering::SeqCst) {
            return None;
        }
        // 跳过换代残留帧，拿到当前代的一帧
        let guard = loop {
            let mut guard = core.sample_queue.peek_readable()?;
            guard.next();
            if guard.peek_last().serial == core.audio_packets.serial() {
                break guard;
            }
        };
        let sample = guard.peek_last();
        let frame = &sample.frame;
        let sample_count = frame.samples();
        let data_size = sample_count * frame.channels() as usize * frame.format().bytes();

        let mut audio = core.audio.lock();
        let src_freq = audio.source.as_ref().map(|s| s.freq).unwrap_or(frame.rate());
        let wanted = if core.master_sync_type() != AvSyncType::AudioMaster {
            let diff = core.audio_clock.get() - core.master_clock();
            audio.drift.wanted_samples(sample_count, diff, src_freq)
        } else {
            sample_count
        };

        let target = audio.target.clone()?;
        let source_mismatch = match &audio.source {
            Some(src) => {
                frame.format() != src.format
                    || normalized_layout(frame) != src.channel_layout
                    || frame.rate() != src.freq
            }
            None => true,
        };
        if source_mismatch || (wanted != sample_count && audio.swr.is_none()) {
            audio.swr = None;
            match software::resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                target.format,
                target.channel_layout,
                target.freq,
            ) {
                Ok(ctx) => audio.swr = Some(Resampler(ctx)),
                Err(e) => {
                    error!(
                        "{} ❌ 无法创建重采样器 {}Hz/{:?} -> {}Hz/{:?}: {}",
                        log_ctx(),
                        frame.rate(),
                        frame.format(),
                        target.freq,
                        target.format,
                        e
                    );
                    return None;
                }
            }
            audio.source = Some(AudioParams::derive(
                frame.rate(),
                normalized_layout(frame),
                frame.format(),
            ));
        }

        out.clear();
        if let Some(swr) = audio.swr.as_mut() {
            if wanted != sample_count {
                let delta = (wanted as i64 - sample_count as i64) * target.freq as i64
                    / frame.rate() as i64;
                let distance = wanted as i64 * target.freq as i64 / frame.rate() as i64;
                let ret = unsafe {
                    ffi::swr_set_compensation(swr.0.as_mut_ptr(), delta as c_int, distance as c_int)
                };
                if ret < 0 {
                    error!("{} ❌ swr_set_compensation 失败", log_ctx());
                    return None;
                }
            }
            let mut resampled = ffmpeg::util::frame::Audio::empty();
            if let Err(e) = swr.0.run(frame, &mut resampled) {
                error!("{} ❌ 重采样失败: {}", log_ctx(), e);
                return None;
            }
            let len = resampled.samples() * target.channels() * target.format.bytes();
            out.extend_from_slice(&resampled.data(0)[..len]);
        } else {
            out.extend_from_slice(&frame.data(0)[..data_size]);
        }

        // 更新音频钟种子：帧 pts + 帧时长
        audio.clock_value = if !sample.pts.is_nan() {
            sample.pts + sample_count as f64 / frame.rate() as f64
        } else {
            f64::NAN
        };
        audio.clock_serial = sample.serial;
        Some(out.len())
    }

    /// 设备回调写完一段数据后回填音频钟：
    /// 扣除两级硬件缓冲与本次写入的在途延迟，再把外部钟拉向音频钟
    pub fn sync_audio(&self, write_start: Instant, written: usize) {
        let core = &self.core;
        let audio = core.audio.lock();
        let Some(target) = audio.target.as_ref() else {
            return;
        };
        if audio.clock_value.is_nan() || target.bytes_per_sec == 0 {
            return;
        }
        let latency = (2 * audio.hw_buf_size + written) as f64 / target.bytes_per_sec as f64;
        core.audio_clock.set_at(
            audio.clock_value - latency,
            audio.clock_serial,
            instant_seconds(write_start),
        );
        core.external_clock
            .sync_to_slave(&core.audio_clock, AV_NOSYNC_THRESHOLD);
    }

    // ---------- 只读接口 ----------

    pub fn audio_params(&self) -> Option<AudioParams> {
        self.core.audio.lock().target.clone()
    }

    pub fn audio_volume(&self) -> i32 {
        self.core.audio_volume.load(Ordering::SeqCst)
    }

    /// 打开后的媒体源快照
    pub fn source_info(&self) -> Option<SourceInfo> {
        self.core.source.read().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.core.paused.load(Ordering::SeqCst)
    }

    pub fn force_refresh(&self) -> bool {
        self.core.force_refresh.load(Ordering::SeqCst)
    }

    pub fn set_force_refresh(&self, force_refresh: bool) {
        self.core.force_refresh.store(force_refresh, Ordering::SeqCst);
    }

    pub fn master_clock_value(&self) -> f64 {
        self.core.master_clock()
    }

    pub fn queue_stats(&self) -> QueueStats {
        let core = &self.core;
        QueueStats {
            video_packets: core.video_packets.packet_count(),
            audio_packets: core.audio_packets.packet_count(),
            video_bytes: core.video_packets.size_bytes(),
            audio_bytes: core.audio_packets.size_bytes(),
            video_frames: core.picture_queue.remaining(),
            audio_frames: core.sample_queue.remaining(),
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if self.opened && !self.closed {
            warn!("{} ⚠ Player 被 drop 但未调用 close()，执行兜底关闭", log_ctx());
        }
        self.close();
    }
}

// ---------- 解复用线程 ----------

extern "C" fn demux_interrupt_cb(opaque: *mut c_void) -> c_int {
    // opaque 指向 PlayerCore；读线程持有 Arc 保证其存活
    let core = unsafe { &*(opaque as *const PlayerCore) };
    core.abort_request.load(Ordering::SeqCst) as c_int
}

unsafe fn stream_ptr(ictx: &format::context::Input, index: usize) -> *mut ffi::AVStream {
    *(*ictx.as_ptr()).streams.add(index)
}

fn is_realtime(format_name: &str, url: &str) -> bool {
    format_name == "rtp"
        || format_name == "rtsp"
        || format_name == "sdp"
        || url.starts_with("rtp:")
        || url.starts_with("udp:")
}

/// 流是否已囤够包：超过 MIN_FRAMES 且（时长未知或超过 1 秒）
fn has_enough_packets(ictx: &format::context::Input, stream_index: i32, queue: &PacketQueue) -> bool {
    if stream_index < 0 || queue.is_aborted() {
        return true;
    }
    let (disposition, time_base) = unsafe {
        let stream = stream_ptr(ictx, stream_index as usize);
        ((*stream).disposition, Rational::from((*stream).time_base))
    };
    if (disposition & ffi::AV_DISPOSITION_ATTACHED_PIC) != 0 {
        return true;
    }
    queue.packet_count() > MIN_FRAMES
        && (queue.duration() == 0 || q2d(time_base) * queue.duration() as f64 > 1.0)
}

fn open_input(
    core: &Arc<PlayerCore>,
    filename: &str,
    input_format: Option<&str>,
) -> Result<format::context::Input> {
    let filename_c =
        CString::new(filename).map_err(|_| PlayerError::OpenError("路径包含 NUL".into()))?;
    let mut dict = ffmpeg::Dictionary::new();
    for (k, v) in &core.opts.format_opts {
        dict.set(k, v);
    }
    if !core.opts.format_opts.iter().any(|(k, _)| k == "scan_all_pmts") {
        dict.set("scan_all_pmts", "1");
    }
    unsafe {
        let mut ctx = ffi::avformat_alloc_context();
        if ctx.is_null() {
            return Err(PlayerError::OpenError("avformat_alloc_context 失败".into()));
        }
        (*ctx).interrupt_callback.callback = Some(demux_interrupt_cb);
        (*ctx).interrupt_callback.opaque = Arc::as_ptr(core) as *mut c_void;

        let fmt = match input_format {
            Some(name) => {
                let name_c = CString::new(name)
                    .map_err(|_| PlayerError::OpenError("输入格式名包含 NUL".into()))?;
                let found = ffi::av_find_input_format(name_c.as_ptr());
                if found.is_null() {
                    warn!("{} 找不到输入格式 {}，按自动探测处理", log_ctx(), name);
                }
                found
            }
            None => std::ptr::null(),
        };
        let mut opts_ptr = dict.disown();
        let ret = ffi::avformat_open_input(&mut ctx, filename_c.as_ptr(), fmt, &mut opts_ptr);
        ffi::av_dict_free(&mut opts_ptr);
        if ret < 0 {
            // 失败时 avformat_open_input 已释放 ctx
            return Err(PlayerError::OpenError(format!(
                "无法打开 {filename}: {}",
                ffmpeg::Error::from(ret)
            )));
        }
        Ok(format::context::Input::wrap(ctx))
    }
}

/// 解复用读循环。自然播完返回 Ok；致命错误通过 on_error 通知宿主后返回 Err
fn read_loop(core: &Arc<PlayerCore>, filename: &str, input_format: Option<&str>) -> Result<()> {
    info!("{} 🎬 解复用线程启动: {}", log_ctx(), filename);
    let result = read_loop_inner(core, filename, input_format);
    match &result {
        Ok(()) => info!("{} 解复用线程结束", log_ctx()),
        Err(PlayerError::Aborted) => info!("{} 🛑 解复用线程被中止", log_ctx()),
        Err(e) => {
            error!("{} ❌ 解复用线程错误: {}", log_ctx(), e);
            if let Some(on_error) = &core.opts.on_error {
                on_error(e);
            }
        }
    }
    result
}

fn read_loop_inner(
    core: &Arc<PlayerCore>,
    filename: &str,
    input_format: Option<&str>,
) -> Result<()> {
    let mut ictx = open_input(core, filename, input_format)?;

    unsafe {
        if core.opts.genpts {
            (*ictx.as_mut_ptr()).flags |= ffi::AVFMT_FLAG_GENPTS;
        }
    }
    if core.opts.find_stream_info {
        let ret = unsafe { ffi::avformat_find_stream_info(ictx.as_mut_ptr(), std::ptr::null_mut()) };
        if ret < 0 {
            warn!("{} {}: 无法探测编解码参数", log_ctx(), filename);
            return Err(PlayerError::OpenError(format!("探测流信息失败: {filename}")));
        }
    }
    unsafe {
        let pb = (*ictx.as_mut_ptr()).pb;
        if !pb.is_null() {
            (*pb).eof_reached = 0;
        }
    }

    let format_name = ictx.format().name().to_string();
    let format_flags = unsafe { (*(*ictx.as_ptr()).iformat).flags };
    let seek_by_bytes = core.opts.seek_by_bytes
        && (format_flags & ffi::AVFMT_NO_BYTE_SEEK) == 0
        && (format_flags & ffi::AVFMT_TS_DISCONT) != 0
        && format_name != "ogg";
    core.seek_by_bytes.store(seek_by_bytes, Ordering::SeqCst);
    let max_frame_duration = if (format_flags & ffi::AVFMT_TS_DISCONT) != 0 {
        10.0
    } else {
        3600.0
    };

    let ctx_start_time = unsafe { (*ictx.as_ptr()).start_time };
    if let Some(start) = core.opts.start_time {
        let mut timestamp = start;
        if ctx_start_time != ffi::AV_NOPTS_VALUE {
            timestamp += ctx_start_time;
        }
        let ret = unsafe {
            ffi::avformat_seek_file(ictx.as_mut_ptr(), -1, i64::MIN, timestamp, i64::MAX, 0)
        };
        if ret < 0 {
            warn!(
                "{} {}: 无法 seek 到起始位置 {:.3}",
                log_ctx(),
                filename,
                timestamp as f64 / AV_TIME_BASE as f64
            );
        }
    }

    let realtime = is_realtime(&format_name, filename);
    core.realtime.store(realtime, Ordering::SeqCst);

    {
        let duration = ictx.duration();
        *core.source.write() = Some(SourceInfo {
            url: filename.to_string(),
            format_name: format_name.clone(),
            start_time: (ctx_start_time != ffi::AV_NOPTS_VALUE).then_some(ctx_start_time),
            duration: (duration != ffi::AV_NOPTS_VALUE).then_some(duration),
            bit_rate: ictx.bit_rate(),
            realtime,
            max_frame_duration,
            chapters: ictx
                .chapters()
                .map(|c| ChapterInfo {
                    start: c.start(),
                    end: c.end(),
                    time_base: c.time_base(),
                })
                .collect(),
        });
    }

    unsafe {
        for i in 0..(*ictx.as_ptr()).nb_streams as usize {
            (*stream_ptr(&ictx, i)).discard = ffi::AVDiscard::AVDISCARD_ALL;
        }
    }

    let video_index = unsafe {
        ffi::av_find_best_stream(
            ictx.as_mut_ptr(),
            media::Type::Video.into(),
            -1,
            -1,
            std::ptr::null_mut(),
            0,
        )
    };
    let audio_index = if core.opts.audio_disable {
        -1
    } else {
        unsafe {
            ffi::av_find_best_stream(
                ictx.as_mut_ptr(),
                media::Type::Audio.into(),
                -1,
                video_index,
                std::ptr::null_mut(),
                0,
            )
        }
    };

    // 提前把视频尺寸报给展示端
    if video_index >= 0 {
        if let Some(meta_cb) = &core.opts.video.meta_cb {
            unsafe {
                let stream = stream_ptr(&ictx, video_index as usize);
                let par = (*stream).codecpar;
                if (*par).width != 0 {
                    let sar = Rational::from(ffi::av_guess_sample_aspect_ratio(
                        ictx.as_mut_ptr(),
                        stream,
                        std::ptr::null_mut(),
                    ));
                    let _ = meta_cb((*par).width as u32, (*par).height as u32, sar);
                }
            }
        }
    }

    if audio_index >= 0 {
        if let Err(e) = stream_open(core, &mut ictx, audio_index as usize, media::Type::Audio) {
            warn!("{} ❌ 打开音频流失败: {}", log_ctx(), e);
        }
    }
    if video_index >= 0 {
        stream_open(core, &mut ictx, video_index as usize, media::Type::Video)?;
    }
    if core.video_stream_index.load(Ordering::SeqCst) < 0
        && core.audio_stream_index.load(Ordering::SeqCst) < 0
    {
        error!("{} ❌ {}: 没有可播放的流", log_ctx(), filename);
        return Err(PlayerError::NoPlayableStream);
    }

    let mut packet = ffmpeg::Packet::empty();
    loop {
        if core.abort_request.load(Ordering::SeqCst) {
            return Err(PlayerError::Aborted);
        }

        // 暂停状态传导到输入协议（尽力而为）
        let paused = core.paused.load(Ordering::SeqCst);
        if core.last_paused.swap(paused, Ordering::SeqCst) != paused {
            if paused {
                let ret = unsafe { ffi::av_read_pause(ictx.as_mut_ptr()) };
                core.read_pause_ok.store(ret >= 0, Ordering::SeqCst);
            } else {
                unsafe { ffi::av_read_play(ictx.as_mut_ptr()) };
            }
        }

        // 流切换请求（持有输入上下文的线程才允许开关流）
        let cycle_request = core.cycle.lock().take();
        if let Some(kind) = cycle_request {
            cycle_stream(core, &mut ictx, kind);
        }

        // seek 请求
        let seek_request = core.seek.lock().take();
        if let Some(req) = seek_request {
            let seek_min = if req.rel > 0 {
                req.pos - req.rel + 2
            } else {
                i64::MIN
            };
            let seek_max = if req.rel < 0 {
                req.pos - req.rel - 2
            } else {
                i64::MAX
            };
            let flags = if req.by_bytes { ffi::AVSEEK_FLAG_BYTE } else { 0 };
            let ret = unsafe {
                ffi::avformat_seek_file(ictx.as_mut_ptr(), -1, seek_min, req.pos, seek_max, flags)
            };
            if ret < 0 {
                // seek 失败只记录，维持当前位置继续播放
                error!("{} ❌ {}: seek 失败: {}", log_ctx(), filename, ffmpeg::Error::from(ret));
            } else {
                info!("{} ⏩ seek 完成: pos={}", log_ctx(), req.pos);
                if core.audio_stream_index.load(Ordering::SeqCst) >= 0 {
                    core.audio_packets.flush();
                }
                if core.video_stream_index.load(Ordering::SeqCst) >= 0 {
                    core.video_packets.flush();
                }
                if req.by_bytes {
                    core.external_clock.set(f64::NAN, 0);
                } else {
                    core.external_clock
                        .set(req.pos as f64 / AV_TIME_BASE as f64, 0);
                }
            }
            core.queue_attachments_req.store(true, Ordering::SeqCst);
            core.eof.store(false, Ordering::SeqCst);
            if core.paused.load(Ordering::SeqCst) {
                core.step_to_next_frame();
            }
        }

        // 封面图（attached picture）注入：一张图 + 一个空包
        if core.queue_attachments_req.swap(false, Ordering::SeqCst) {
            let video_stream_index = core.video_stream_index.load(Ordering::SeqCst);
            if video_stream_index >= 0 {
                unsafe {
                    let stream = stream_ptr(&ictx, video_stream_index as usize);
                    if ((*stream).disposition & ffi::AV_DISPOSITION_ATTACHED_PIC) != 0 {
                        let mut pic = ffmpeg::Packet::empty();
                        let ret = ffi::av_packet_ref(pic.as_mut_ptr(), &(*stream).attached_pic);
                        if ret < 0 {
                            return Err(ffmpeg::Error::from(ret).into());
                        }
                        let _ = core.video_packets.put(pic);
                        let _ = core.video_packets.put_null(video_stream_index as usize);
                    }
                }
            }
        }

        // 背压：字节总量超限或两条流都囤够了，就小睡等待解码端消耗
        let over_limit = core.audio_packets.size_bytes() + core.video_packets.size_bytes()
            > MAX_QUEUE_SIZE
            || (has_enough_packets(
                &ictx,
                core.audio_stream_index.load(Ordering::SeqCst),
                &core.audio_packets,
            ) && has_enough_packets(
                &ictx,
                core.video_stream_index.load(Ordering::SeqCst),
                &core.video_packets,
            ));
        if over_limit {
            core.read_wake.wait_timeout(Duration::from_millis(10));
            continue;
        }

        // 播放结束判定：两侧解码器都在当前代收到 EOF 且帧队列已排空
        if !core.paused.load(Ordering::SeqCst) {
            let finished = {
                let decoders = core.decoders.lock();
                let audio_done = if core.audio_stream_index.load(Ordering::SeqCst) >= 0 {
                    decoders.audio.as_ref().map_or(true, |d| {
                        d.finished_serial() == core.audio_packets.serial()
                            && core.sample_queue.remaining() == 0
                    })
                } else {
                    true
                };
                let video_done = if core.video_stream_index.load(Ordering::SeqCst) >= 0 {
                    decoders.video.as_ref().map_or(true, |d| {
                        d.finished_serial() == core.video_packets.serial()
                            && core.picture_queue.remaining() == 0
                    })
                } else {
                    true
                };
                audio_done && video_done
            };
            if finished {
                if core.opts.loop_playback {
                    info!("{} 🔁 循环播放，回到起点", log_ctx());
                    core.stream_seek(core.opts.start_time.unwrap_or(0), 0, false);
                } else {
                    info!("{} 📄 播放完毕", log_ctx());
                    return Ok(());
                }
            }
        }

        // 读包
        if let Err(err) = packet.read(&mut ictx) {
            let pb_eof = unsafe {
                let pb = (*ictx.as_ptr()).pb;
                !pb.is_null() && ffi::avio_feof(pb) != 0
            };
            if (matches!(err, ffmpeg::Error::Eof) || pb_eof)
                && !core.eof.swap(true, Ordering::SeqCst)
            {
                // EOF：给每条流补一个空包让解码器排空
                let video_stream_index = core.video_stream_index.load(Ordering::SeqCst);
                if video_stream_index >= 0 {
                    let _ = core.video_packets.put_null(video_stream_index as usize);
                }
                let audio_stream_index = core.audio_stream_index.load(Ordering::SeqCst);
                if audio_stream_index >= 0 {
                    let _ = core.audio_packets.put_null(audio_stream_index as usize);
                }
            }
            let io_error = unsafe {
                let pb = (*ictx.as_ptr()).pb;
                if pb.is_null() {
                    0
                } else {
                    (*pb).error
                }
            };
            if io_error < 0 {
                return Err(ffmpeg::Error::from(io_error).into());
            }
            core.read_wake.wait_timeout(Duration::from_millis(10));
            continue;
        }
        core.eof.store(false, Ordering::SeqCst);
        core.last_read_pos
            .store(packet.position() as i64, Ordering::SeqCst);

        // 播放区间过滤 + 分流入队
        let stream_index = packet.stream();
        let (stream_start_time, time_base, disposition) = unsafe {
            let stream = stream_ptr(&ictx, stream_index);
            let start = (*stream).start_time;
            (
                (start != ffi::AV_NOPTS_VALUE).then_some(start),
                Rational::from((*stream).time_base),
                (*stream).disposition,
            )
        };
        let in_range = packet_in_play_range(
            core.opts.duration,
            core.opts.start_time,
            packet.pts().or(packet.dts()),
            stream_start_time,
            time_base,
        );
        let audio_stream_index = core.audio_stream_index.load(Ordering::SeqCst);
        let video_stream_index = core.video_stream_index.load(Ordering::SeqCst);
        if stream_index as i32 == audio_stream_index && in_range {
            let owned = std::mem::replace(&mut packet, ffmpeg::Packet::empty());
            let _ = core.audio_packets.put(owned);
        } else if stream_index as i32 == video_stream_index
            && in_range
            && (disposition & ffi::AV_DISPOSITION_ATTACHED_PIC) == 0
        {
            let owned = std::mem::replace(&mut packet, ffmpeg::Packet::empty());
            let _ = core.video_packets.put(owned);
        } else {
            // 其他流或超出播放区间：释放包
            packet = ffmpeg::Packet::empty();
        }
    }
}

/// 打开一条流：建解码器、拉起解码线程。音频流同时完成输出参数协商
fn stream_open(
    core: &Arc<PlayerCore>,
    ictx: &mut format::context::Input,
    stream_index: usize,
    kind: media::Type,
) -> Result<()> {
    let nb_streams = unsafe { (*ictx.as_ptr()).nb_streams } as usize;
    if stream_index >= nb_streams {
        return Err(PlayerError::Other(format!("流索引越界: {stream_index}")));
    }
    let stream = ictx
        .stream(stream_index)
        .ok_or_else(|| PlayerError::Other(format!("流不存在: {stream_index}")))?;
    let time_base = stream.time_base();
    let mut codec_ctx = codec::context::Context::from_parameters(stream.parameters())?;
    unsafe {
        (*codec_ctx.as_mut_ptr()).pkt_timebase = time_base.into();
    }

    let (codec_name, codec_opts, mut lowres, fast) = match kind {
        media::Type::Audio => {
            let o = &core.opts.audio;
            (o.codec_name.as_deref(), &o.codec_opts, o.lowres, o.fast)
        }
        media::Type::Video => {
            let o = &core.opts.video;
            (o.codec_name.as_deref(), &o.codec_opts, o.lowres, o.fast)
        }
        _ => return Ok(()),
    };
    let codec = match codec_name {
        Some(name) => {
            let found = ffmpeg::decoder::find_by_name(name);
            if found.is_none() {
                warn!("{} 找不到名为 {} 的解码器", log_ctx(), name);
            }
            found
        }
        None => ffmpeg::decoder::find(codec_ctx.id()),
    };
    let Some(codec) = codec else {
        return Err(PlayerError::DecodeError(format!(
            "没有可用的解码器: {:?}",
            codec_ctx.id()
        )));
    };
    unsafe {
        let max_lowres = (*codec.as_ptr()).max_lowres as i32;
        if lowres > max_lowres {
            warn!("{} lowres 超出解码器上限，压到 {}", log_ctx(), max_lowres);
            lowres = max_lowres;
        }
        let ptr = codec_ctx.as_mut_ptr();
        (*ptr).lowres = lowres;
        if fast {
            (*ptr).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;
        }
    }
    let mut opts_dict = ffmpeg::Dictionary::new();
    for (k, v) in codec_opts {
        opts_dict.set(k, v);
    }
    if lowres != 0 {
        opts_dict.set("lowres", &lowres.to_string());
    }
    // 让包上的 opaque_ref（文件位置标记）透传到解码输出帧
    opts_dict.set("flags", "+copy_opaque");
    let opened = codec_ctx.decoder().open_as_with(codec, opts_dict)?;

    core.eof.store(false, Ordering::SeqCst);
    unsafe {
        (*stream_ptr(ictx, stream_index)).discard = ffi::AVDiscard::AVDISCARD_DEFAULT;
    }
    let format_flags = unsafe { (*(*ictx.as_ptr()).iformat).flags };
    let stream_start_time = unsafe { (*stream_ptr(ictx, stream_index)).start_time };

    match kind {
        media::Type::Audio => {
            let audio_decoder = opened.audio()?;
            let layout = if audio_decoder.channel_layout().is_empty() {
                ChannelLayout::default(audio_decoder.channels() as i32)
            } else {
                audio_decoder.channel_layout()
            };
            let filter_source =
                AudioParams::derive(audio_decoder.rate(), layout, audio_decoder.format());

            // 先搭一个探测用滤镜图，拿 sink 协商出的布局/采样率去跟设备谈
            let mut probe = configure_audio_graph(&filter_source, &filter_source, false, &core.opts.audio)?;
            let sink_rate = probe.sink_sample_rate();
            let sink_layout = probe.sink_channel_layout();
            let device = match &core.opts.audio.meta_cb {
                Some(meta_cb) => meta_cb(&sink_layout, sink_rate)?,
                None => {
                    // 没有设备回调：按 sink 参数直接收下，硬件缓冲按约 50ms 估算
                    let params = AudioParams::derive(
                        sink_rate,
                        sink_layout,
                        format::Sample::I16(format::sample::Type::Packed),
                    );
                    let hardware_buffer_size = params.bytes_per_sec / 20;
                    AudioDeviceConfig {
                        params,
                        hardware_buffer_size,
                    }
                }
            };
            info!(
                "{} 🔊 音频输出: {} Hz, {} 声道, 硬件缓冲 {} 字节",
                log_ctx(),
                device.params.freq,
                device.params.channels(),
                device.hardware_buffer_size
            );
            {
                let mut audio = core.audio.lock();
                audio.source = Some(device.params.clone());
                audio.hw_buf_size = device.hardware_buffer_size;
                audio.drift = AudioDrift::new(
                    device.hardware_buffer_size as f64 / device.params.bytes_per_sec as f64,
                );
                audio.clock_value = f64::NAN;
                audio.clock_serial = -1;
                audio.swr = None;
                audio.target = Some(device.params);
            }

            let mut driver = DecoderDriver::new(
                MediaDecoder::Audio(audio_decoder),
                core.audio_packets.clone(),
                core.read_wake.clone(),
                false,
                time_base,
            );
            if (format_flags & ffi::AVFMT_NOTIMESTAMPS) != 0
                && stream_start_time != ffi::AV_NOPTS_VALUE
            {
                driver.set_start_pts(stream_start_time, time_base);
            }
            let worker_core = core.clone();
            let decoder = Decoder::spawn("audio_decoder", driver, move |driver| {
                audio_worker(worker_core, driver, AudioPipeline { filter_source })
            })?;
            core.decoders.lock().audio = Some(decoder);
            core.audio_stream_index.store(stream_index as i32, Ordering::SeqCst);
            core.last_audio_stream_index.store(stream_index as i32, Ordering::SeqCst);
        }
        media::Type::Video => {
            let video_decoder = opened.video()?;
            let (sample_aspect_ratio, frame_rate, display_matrix) = unsafe {
                let stream = stream_ptr(ictx, stream_index);
                (
                    Rational::from(ffi::av_guess_sample_aspect_ratio(
                        ictx.as_mut_ptr(),
                        stream,
                        std::ptr::null_mut(),
                    )),
                    Rational::from(ffi::av_guess_frame_rate(
                        ictx.as_mut_ptr(),
                        stream,
                        std::ptr::null_mut(),
                    )),
                    stream_display_matrix(stream),
                )
            };
            let driver = DecoderDriver::new(
                MediaDecoder::Video(video_decoder),
                core.video_packets.clone(),
                core.read_wake.clone(),
                core.opts.video.reorder_pts,
                time_base,
            );
            let worker_core = core.clone();
            let pipeline = VideoPipeline {
                time_base,
                sample_aspect_ratio,
                frame_rate,
                display_matrix,
            };
            let decoder = Decoder::spawn("video_decoder", driver, move |driver| {
                video_worker(worker_core, driver, pipeline)
            })?;
            core.decoders.lock().video = Some(decoder);
            core.video_stream_index.store(stream_index as i32, Ordering::SeqCst);
            core.last_video_stream_index.store(stream_index as i32, Ordering::SeqCst);
            core.queue_attachments_req.store(true, Ordering::SeqCst);
        }
        _ => {}
    }
    Ok(())
}

/// 流级旋转侧数据（帧级缺失时的回退）
unsafe fn stream_display_matrix(stream: *const ffi::AVStream) -> Option<[i32; 9]> {
    let par = (*stream).codecpar;
    let side_data = (*par).coded_side_data;
    if side_data.is_null() {
        return None;
    }
    for i in 0..(*par).nb_coded_side_data as isize {
        let entry = side_data.offset(i);
        if (*entry).type_ == ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX
            && (*entry).size as usize >= 36
        {
            let bytes = std::slice::from_raw_parts((*entry).data, (*entry).size as usize);
            return matrix_from_bytes(bytes);
        }
    }
    None
}

/// 关闭一条流：中止解码器、join 线程、清理相关状态
fn close_stream(core: &Arc<PlayerCore>, kind: media::Type) {
    match kind {
        media::Type::Audio => {
            let taken = core.decoders.lock().audio.take();
            if let Some(mut decoder) = taken {
                decoder.abort(&core.sample_queue);
            }
            {
                let mut audio = core.audio.lock();
                audio.swr = None;
                audio.clock_value = f64::NAN;
            }
            core.audio_stream_index.store(-1, Ordering::SeqCst);
        }
        media::Type::Video => {
            let taken = core.decoders.lock().video.take();
            if let Some(mut decoder) = taken {
                decoder.abort(&core.picture_queue);
            }
            core.video_stream_index.store(-1, Ordering::SeqCst);
        }
        _ => {}
    }
}

/// 在解复用线程上执行流切换：挑下一条可用的同类型流并重开
fn cycle_stream(core: &Arc<PlayerCore>, ictx: &mut format::context::Input, kind: media::Type) {
    let (old_index, last_index) = match kind {
        media::Type::Audio => (
            core.audio_stream_index.load(Ordering::SeqCst),
            core.last_audio_stream_index.load(Ordering::SeqCst),
        ),
        media::Type::Video => (
            core.video_stream_index.load(Ordering::SeqCst),
            core.last_video_stream_index.load(Ordering::SeqCst),
        ),
        _ => return,
    };
    let nb_streams = unsafe { (*ictx.as_ptr()).nb_streams } as i32;
    if nb_streams == 0 {
        return;
    }
    let start = last_index.max(-1);
    let mut candidate = None;
    for offset in 1..=nb_streams {
        let index = (start + offset).rem_euclid(nb_streams);
        if index == old_index {
            continue;
        }
        let usable = unsafe {
            let stream = stream_ptr(ictx, index as usize);
            let par = (*stream).codecpar;
            if media::Type::from((*par).codec_type) != kind {
                false
            } else if kind == media::Type::Audio {
                (*par).sample_rate != 0 && (*par).ch_layout.nb_channels != 0
            } else {
                true
            }
        };
        if usable {
            candidate = Some(index);
            break;
        }
    }
    let Some(new_index) = candidate else {
        debug!("{} 没有可切换的 {:?} 流", log_ctx(), kind);
        return;
    };
    info!(
        "{} 切换 {:?} 流: #{} -> #{}",
        log_ctx(),
        kind,
        old_index,
        new_index
    );
    if old_index >= 0 {
        unsafe {
            (*stream_ptr(ictx, old_index as usize)).discard = ffi::AVDiscard::AVDISCARD_ALL;
        }
    }
    close_stream(core, kind);
    if let Err(e) = stream_open(core, ictx, new_index as usize, kind) {
        error!("{} ❌ 打开流 #{} 失败: {}", log_ctx(), new_index, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_player(av_sync_type: AvSyncType) -> Player {
        let opts = PlayerOptions {
            av_sync_type,
            ..Default::default()
        };
        Player::new(opts).expect("player")
    }

    #[test]
    fn test_master_sync_fallthrough() {
        let player = new_player(AvSyncType::AudioMaster);
        // 没有任何流：AUDIO 退到 EXTERNAL
        assert_eq!(player.core.master_sync_type(), AvSyncType::ExternalClock);
        player.core.audio_stream_index.store(1, Ordering::SeqCst);
        assert_eq!(player.core.master_sync_type(), AvSyncType::AudioMaster);

        let player = new_player(AvSyncType::VideoMaster);
        // 没有视频流：VIDEO 退到 AUDIO
        assert_eq!(player.core.master_sync_type(), AvSyncType::AudioMaster);
        player.core.video_stream_index.store(0, Ordering::SeqCst);
        assert_eq!(player.core.master_sync_type(), AvSyncType::VideoMaster);
    }

    #[test]
    fn test_toggle_pause_roundtrip() {
        let player = new_player(AvSyncType::ExternalClock);
        player.core.external_clock.set(42.0, 7);
        let before = player.core.external_clock.get();

        player.toggle_pause();
        assert!(player.is_paused());
        std::thread::sleep(Duration::from_millis(20));
        player.toggle_pause();
        assert!(!player.is_paused());

        let after = player.core.external_clock.get();
        assert!((after - before).abs() < 0.05, "before={before} after={after}");
    }

    #[test]
    fn test_step_unpauses() {
        let player = new_player(AvSyncType::ExternalClock);
        player.toggle_pause();
        assert!(player.is_paused());
        player.step_to_next_frame();
        assert!(!player.is_paused());
        assert!(player.core.step.load(Ordering::SeqCst));
        // toggle_pause 清除 step
        player.toggle_pause();
        assert!(!player.core.step.load(Ordering::SeqCst));
    }

    #[test]
    fn test_seek_requests_coalesce() {
        let player = new_player(AvSyncType::ExternalClock);
        player.core.stream_seek(1_000_000, 0, false);
        player.core.stream_seek(2_000_000, 0, false);
        let req = player.core.seek.lock().take().expect("seek request");
        // 未消费前的第二个请求被忽略
        assert_eq!(req.pos, 1_000_000);
        assert!(player.core.seek.lock().is_none());
    }

    #[test]
    fn test_update_volume_clamps() {
        let player = new_player(AvSyncType::ExternalClock);
        for _ in 0..100 {
            player.update_volume(128, 1, 0.75);
        }
        assert_eq!(player.audio_volume(), 128);
        for _ in 0..300 {
            player.update_volume(128, -1, 0.75);
        }
        assert_eq!(player.audio_volume(), 0);
    }

    #[test]
    fn test_acquire_video_frame_without_stream() {
        let player = new_player(AvSyncType::ExternalClock);
        let mut remaining = 0.01;
        assert!(player.acquire_video_frame(&mut remaining).is_none());
        assert!(!player.force_refresh());
    }

    #[test]
    fn test_queue_stats_empty() {
        let player = new_player(AvSyncType::ExternalClock);
        let stats = player.queue_stats();
        assert_eq!(stats.video_packets, 0);
        assert_eq!(stats.audio_packets, 0);
        assert_eq!(stats.video_frames, 0);
        assert_eq!(stats.audio_frames, 0);
    }
}
