use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::frame;
use ffmpeg_next::{format, ChannelLayout, Rational};
use log::{debug, error};

use crate::core::clock::relative_seconds;
use crate::core::types::q2d;
use crate::core::{AudioParams, AvSyncType, PlayerError, Result};
use crate::player::decoder::{frame_packet_pos, Decoded, DecoderDriver};
use crate::player::filters::{configure_audio_graph, configure_video_graph, VideoFilterGraph};
use crate::player::manager::PlayerCore;
use crate::player::sync::AV_NOSYNC_THRESHOLD;

/// 视频流水线上下文（打开流时从容器快照）
pub(crate) struct VideoPipeline {
    pub time_base: Rational,
    /// 流级采样宽高比（优先于帧自带值）
    pub sample_aspect_ratio: Rational,
    /// 容器猜测的帧率
    pub frame_rate: Rational,
    /// 流级 display matrix（帧级侧数据优先）
    pub display_matrix: Option<[i32; 9]>,
}

enum Acquired {
    Frame,
    Dropped,
    Stop,
}

/// 视频解码线程入口
pub(crate) fn video_worker(core: Arc<PlayerCore>, mut driver: DecoderDriver, ctx: VideoPipeline) {
    match video_worker_inner(&core, &mut driver, &ctx) {
        Ok(()) => debug!("视频解码线程退出"),
        Err(e) => error!("视频解码线程异常退出: {e}"),
    }
}

fn video_worker_inner(
    core: &PlayerCore,
    driver: &mut DecoderDriver,
    ctx: &VideoPipeline,
) -> Result<()> {
    let mut frame = frame::Video::empty();
    let mut graph: Option<VideoFilterGraph> = None;
    let mut frame_rate = ctx.frame_rate;
    let mut last_width = 0u32;
    let mut last_height = 0u32;
    let mut last_format: Option<format::Pixel> = None;
    let mut last_serial = -1;
    let mut frame_last_filter_delay = 0.0f64;

    loop {
        match acquire_frame(core, driver, &mut frame, ctx, frame_last_filter_delay)? {
            Acquired::Stop => return Ok(()),
            Acquired::Dropped => continue,
            Acquired::Frame => {}
        }

        if last_width != frame.width()
            || last_height != frame.height()
            || last_format != Some(frame.format())
            || last_serial != driver.packet_serial()
        {
            debug!(
                "视频帧参数变化: {}x{} {:?} serial:{} -> {}x{} {:?} serial:{}",
                last_width,
                last_height,
                last_format,
                last_serial,
                frame.width(),
                frame.height(),
                frame.format(),
                driver.packet_serial()
            );
            let built = configure_video_graph(
                &frame,
                ctx.time_base,
                ctx.sample_aspect_ratio,
                ctx.frame_rate,
                ctx.display_matrix,
                &core.opts.video,
            )?;
            frame_rate = built.frame_rate();
            last_width = frame.width();
            last_height = frame.height();
            last_format = Some(frame.format());
            last_serial = driver.packet_serial();
            graph = Some(built);
        }
        let Some(g) = graph.as_mut() else {
            continue;
        };

        g.push(&frame)?;
        loop {
            let returned_at = relative_seconds();
            match g.pull(&mut frame) {
                Err(ffmpeg::Error::Other { errno: 11 }) => break, // EAGAIN
                Err(ffmpeg::Error::Eof) => {
                    driver.set_finished();
                    break;
                }
                Err(e) => return Err(e.into()),
                Ok(()) => {
                    frame_last_filter_delay = relative_seconds() - returned_at;
                    if frame_last_filter_delay.abs() > AV_NOSYNC_THRESHOLD / 10.0 {
                        frame_last_filter_delay = 0.0;
                    }
                    let time_base = g.time_base();
                    let duration = if frame_rate.numerator() != 0 && frame_rate.denominator() != 0 {
                        q2d(Rational::new(frame_rate.denominator(), frame_rate.numerator()))
                    } else {
                        0.0
                    };
                    let pts = frame
                        .pts()
                        .map(|p| p as f64 * q2d(time_base))
                        .unwrap_or(f64::NAN);
                    let pos = frame_packet_pos(&frame);
                    if !queue_picture(core, &mut frame, pts, duration, pos, driver.packet_serial())? {
                        return Ok(());
                    }
                    if core.video_packets.serial() != driver.packet_serial() {
                        break;
                    }
                }
            }
        }
    }
}

/// 解出一帧并决定是否提前丢弃（视频不是主钟且已明显落后时）
fn acquire_frame(
    core: &PlayerCore,
    driver: &mut DecoderDriver,
    frame: &mut frame::Video,
    ctx: &VideoPipeline,
    frame_last_filter_delay: f64,
) -> Result<Acquired> {
    match driver.decode_video(frame)? {
        Decoded::Aborted => return Ok(Acquired::Stop),
        Decoded::Finished => return Ok(Acquired::Dropped),
        Decoded::Frame => {}
    }
    let dpts = frame.pts().map(|p| p as f64 * q2d(ctx.time_base));

    // 流级 SAR 优先，其次帧自带
    let sar = if ctx.sample_aspect_ratio.numerator() != 0 {
        ctx.sample_aspect_ratio
    } else {
        frame.aspect_ratio()
    };
    unsafe {
        (*frame.as_mut_ptr()).sample_aspect_ratio = sar.into();
    }

    if core.master_sync_type() != AvSyncType::VideoMaster {
        if let Some(dpts) = dpts {
            let diff = dpts - core.master_clock();
            if diff.is_finite()
                && diff.abs() < AV_NOSYNC_THRESHOLD
                && diff - frame_last_filter_delay < 0.0
                && driver.packet_serial() == core.video_clock.serial()
                && core.video_packets.packet_count() > 0
            {
                debug!("提前丢弃落后视频帧: diff={diff:.3}");
                return Ok(Acquired::Dropped);
            }
        }
    }
    Ok(Acquired::Frame)
}

/// 帧入视频帧队列。包队列中止返回 Ok(false)
fn queue_picture(
    core: &PlayerCore,
    frame: &mut frame::Video,
    pts: f64,
    duration: f64,
    pos: i64,
    serial: i32,
) -> Result<bool> {
    let width = frame.width();
    let height = frame.height();
    let pixel_format = frame.format();
    let sar = frame.aspect_ratio();

    if let Some(meta_cb) = &core.opts.video.meta_cb {
        meta_cb(width, height, sar)?;
    }

    let Some(mut guard) = core.picture_queue.peek_writable() else {
        return Ok(false);
    };
    let slot = guard.writable();
    slot.sample_aspect_ratio = sar;
    slot.uploaded = false;
    slot.flip_v = false;
    slot.width = width;
    slot.height = height;
    slot.format = pixel_format;
    slot.pts = pts;
    slot.duration = duration;
    slot.pos = pos;
    slot.serial = serial;
    slot.frame = std::mem::replace(frame, frame::Video::empty());
    guard.push();
    Ok(true)
}

/// 音频流水线上下文
pub(crate) struct AudioPipeline {
    /// 初始滤镜源参数（来自解码器）
    pub filter_source: AudioParams,
}

/// 音频解码线程入口
pub(crate) fn audio_worker(core: Arc<PlayerCore>, mut driver: DecoderDriver, ctx: AudioPipeline) {
    match audio_worker_inner(&core, &mut driver, ctx) {
        Ok(()) => debug!("音频解码线程退出"),
        Err(e) => error!("音频解码线程异常退出: {e}"),
    }
}

fn audio_worker_inner(
    core: &PlayerCore,
    driver: &mut DecoderDriver,
    ctx: AudioPipeline,
) -> Result<()> {
    let mut frame = frame::Audio::empty();
    let mut filter_source = ctx.filter_source;
    let mut graph = None;
    let mut last_serial = -1;

    loop {
        match driver.decode_audio(&mut frame)? {
            Decoded::Aborted => return Ok(()),
            Decoded::Finished => continue,
            Decoded::Frame => {}
        }

        if audio_format_changed(&filter_source, &frame) || driver.packet_serial() != last_serial {
            debug!(
                "音频帧参数变化: rate:{} ch:{} fmt:{:?} serial:{} -> rate:{} ch:{} fmt:{:?} serial:{}",
                filter_source.freq,
                filter_source.channels(),
                filter_source.format,
                last_serial,
                frame.rate(),
                frame.channels(),
                frame.format(),
                driver.packet_serial()
            );
            filter_source =
                AudioParams::derive(frame.rate(), normalized_layout(&frame), frame.format());
            last_serial = driver.packet_serial();
            let target = core
                .audio
                .lock()
                .target
                .clone()
                .ok_or_else(|| PlayerError::AudioError("音频目标参数未协商".into()))?;
            graph = Some(configure_audio_graph(
                &filter_source,
                &target,
                true,
                &core.opts.audio,
            )?);
        }
        let Some(g) = graph.as_mut() else {
            continue;
        };

        g.push(&frame)?;
        loop {
            match g.pull(&mut frame) {
                Err(ffmpeg::Error::Other { errno: 11 }) => break, // EAGAIN
                Err(ffmpeg::Error::Eof) => {
                    driver.set_finished();
                    break;
                }
                Err(e) => return Err(e.into()),
                Ok(()) => {
                    let time_base = g.time_base();
                    let Some(mut guard) = core.sample_queue.peek_writable() else {
                        return Ok(());
                    };
                    let slot = guard.writable();
                    slot.pts = frame
                        .pts()
                        .map(|p| p as f64 * q2d(time_base))
                        .unwrap_or(f64::NAN);
                    slot.pos = frame_packet_pos(&frame);
                    slot.serial = driver.packet_serial();
                    slot.duration = q2d(Rational::new(frame.samples() as i32, frame.rate() as i32));
                    slot.frame = std::mem::replace(&mut frame, frame::Audio::empty());
                    guard.push();

                    if core.audio_packets.serial() != driver.packet_serial() {
                        break;
                    }
                }
            }
        }
    }
}

/// 声道布局缺失时按声道数回退到默认布局
pub(crate) fn normalized_layout(frame: &frame::Audio) -> ChannelLayout {
    let layout = frame.channel_layout();
    if layout.is_empty() {
        ChannelLayout::default(frame.channels() as i32)
    } else {
        layout
    }
}

/// 滤镜源参数与帧是否不一致（单声道按 packed 等价比较采样格式）
fn audio_format_changed(source: &AudioParams, frame: &frame::Audio) -> bool {
    let src_channels = source.channels();
    let frame_channels = frame.channels() as usize;
    let fmt_changed = if src_channels == 1 && frame_channels == 1 {
        packed_format(source.format) != packed_format(frame.format())
    } else {
        src_channels != frame_channels || source.format != frame.format()
    };
    fmt_changed
        || source.channel_layout != normalized_layout(frame)
        || source.freq != frame.rate()
}

fn packed_format(fmt: format::Sample) -> ffmpeg::ffi::AVSampleFormat {
    unsafe { ffmpeg::ffi::av_get_packed_sample_fmt(fmt.into()) }
}
