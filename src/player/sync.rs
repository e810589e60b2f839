//! 同步调度的纯计算部分：目标延迟、帧时长、音频漂移校正、外部时钟变速

use ffmpeg_next::Rational;
use log::trace;

use crate::core::types::q2d;
use crate::player::frame::PictureFrame;

/// A/V 偏差超过该值即放弃同步校正（秒）
pub(crate) const AV_NOSYNC_THRESHOLD: f64 = 10.0;
pub(crate) const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
pub(crate) const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// 超过该帧时长就不再用加倍延迟而是叠加偏差
pub(crate) const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

pub(crate) const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub(crate) const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub(crate) const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;
pub(crate) const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub(crate) const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;

pub(crate) const AUDIO_DIFF_AVG_NB: u32 = 20;
pub(crate) const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;

/// 包队列"足够"判定的下限
pub(crate) const MIN_FRAMES: usize = 10;
/// 两个包队列的总字节上限（背压阈值）
pub(crate) const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;

/// 根据视频钟与主钟的偏差调整下一帧的目标延迟
///
/// diff = 视频钟 - 主钟（主钟为视频时调用方传 NaN 跳过校正）。
/// 落后则压缩延迟追赶，超前且帧较长则叠加偏差，超前且帧较短则加倍延迟。
pub(crate) fn compute_target_delay(mut delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    let sync_threshold = delay.clamp(AV_SYNC_THRESHOLD_MIN, AV_SYNC_THRESHOLD_MAX);
    if !diff.is_nan() && diff.abs() < max_frame_duration {
        if diff <= -sync_threshold {
            delay = (delay + diff).max(0.0);
        } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
            delay += diff;
        } else if diff >= sync_threshold {
            delay *= 2.0;
        }
    }
    trace!("video: delay={:.3} A-V={}", delay, -diff);
    delay
}

/// 相邻两帧的展示时长：PTS 差在 (0, max] 内取差值，否则退回帧自带时长。
/// 跨代（serial 不同）返回 0
pub(crate) fn frame_duration(frame: &PictureFrame, next: &PictureFrame, max_frame_duration: f64) -> f64 {
    if frame.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - frame.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        frame.duration
    } else {
        duration
    }
}

/// 音频漂移累积状态
///
/// 对 audio_clock - master 做指数加权累积，均值超过阈值后
/// 微调本次要输出的采样数（限制在 ±10% 内）换取无感追赶。
pub(crate) struct AudioDrift {
    cum: f64,
    avg_coef: f64,
    avg_count: u32,
    pub threshold: f64,
}

impl AudioDrift {
    pub fn new(threshold: f64) -> Self {
        Self {
            cum: 0.0,
            avg_coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            avg_count: 0,
            threshold,
        }
    }

    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.avg_count = 0;
    }

    /// 返回校正后的期望采样数。diff 无效（NaN 或超界）时重置累积
    pub fn wanted_samples(&mut self, sample_count: usize, diff: f64, src_freq: u32) -> usize {
        if !diff.is_nan() && diff.abs() < AV_NOSYNC_THRESHOLD {
            self.cum = diff + self.avg_coef * self.cum;
            if self.avg_count < AUDIO_DIFF_AVG_NB {
                self.avg_count += 1;
            } else {
                let avg_diff = self.cum * (1.0 - self.avg_coef);
                if avg_diff.abs() >= self.threshold {
                    let wanted = sample_count as i64 + (diff * src_freq as f64) as i64;
                    let min = (sample_count * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
                    let max = (sample_count * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
                    let wanted = wanted.clamp(min, max);
                    trace!(
                        "diff={} adiff={} sample_diff={}",
                        diff,
                        avg_diff,
                        wanted - sample_count as i64
                    );
                    return wanted as usize;
                }
            }
        } else {
            self.reset();
        }
        sample_count
    }
}

/// 实时源 + 外部主钟时的变速自适应：
/// 任一启用的流饥饿则减速，全部充裕则加速，否则向 1.0 缓慢回归
pub(crate) fn adapted_external_speed(
    speed: f64,
    video_packets: Option<usize>,
    audio_packets: Option<usize>,
) -> f64 {
    let starved = matches!(video_packets, Some(n) if n <= EXTERNAL_CLOCK_MIN_FRAMES)
        || matches!(audio_packets, Some(n) if n <= EXTERNAL_CLOCK_MIN_FRAMES);
    let well_filled = video_packets.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES)
        && audio_packets.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES);
    if starved {
        (speed - EXTERNAL_CLOCK_SPEED_STEP).max(EXTERNAL_CLOCK_SPEED_MIN)
    } else if well_filled {
        (speed + EXTERNAL_CLOCK_SPEED_STEP).min(EXTERNAL_CLOCK_SPEED_MAX)
    } else if speed != 1.0 {
        speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs()
    } else {
        speed
    }
}

/// 包时间戳是否落在 start_time/duration 选项限定的播放区间内
pub(crate) fn packet_in_play_range(
    play_duration: Option<i64>,
    play_start_time: Option<i64>,
    pkt_ts: Option<i64>,
    stream_start_time: Option<i64>,
    time_base: Rational,
) -> bool {
    let Some(limit) = play_duration else {
        return true;
    };
    let Some(ts) = pkt_ts else {
        return true;
    };
    let elapsed = (ts - stream_start_time.unwrap_or(0)) as f64 * q2d(time_base)
        - play_start_time.unwrap_or(0) as f64 / 1_000_000.0;
    elapsed <= limit as f64 / 1_000_000.0
}

/// 音量按对数刻度步进（step 单位为 dB/20）
pub(crate) fn stepped_volume(current: i32, max_volume: i32, sign: i32, step: f64) -> i32 {
    let volume_level = if current != 0 {
        20.0 * (current as f64 / max_volume as f64).log10()
    } else {
        -1000.0
    };
    let new_volume =
        (max_volume as f64 * 10f64.powf((volume_level + sign as f64 * step) / 20.0)).round() as i64;
    let next = if current as i64 == new_volume {
        current + sign
    } else {
        new_volume as i32
    };
    next.clamp(0, max_volume)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picture(pts: f64, duration: f64, serial: i32) -> PictureFrame {
        PictureFrame {
            pts,
            duration,
            serial,
            ..Default::default()
        }
    }

    #[test]
    fn test_target_delay_hurry_up() {
        // 视频落后主钟：压缩延迟
        let delay = compute_target_delay(0.04, -0.5, 3600.0);
        assert_eq!(delay, 0.0);
    }

    #[test]
    fn test_target_delay_double_up() {
        // 视频超前且帧较短：加倍
        let delay = compute_target_delay(0.04, 0.08, 3600.0);
        assert_eq!(delay, 0.08);
    }

    #[test]
    fn test_target_delay_slow_down() {
        // 视频超前且帧较长：叠加偏差
        let delay = compute_target_delay(0.2, 0.3, 3600.0);
        assert!((delay - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_target_delay_ignores_huge_diff() {
        let delay = compute_target_delay(0.04, 5000.0, 3600.0);
        assert_eq!(delay, 0.04);
        let delay = compute_target_delay(0.04, f64::NAN, 3600.0);
        assert_eq!(delay, 0.04);
    }

    #[test]
    fn test_frame_duration_fallback() {
        let a = picture(1.0, 0.04, 1);
        let b = picture(1.05, 0.04, 1);
        assert!((frame_duration(&a, &b, 10.0) - 0.05).abs() < 1e-9);

        // PTS 间隔超出上限：退回帧自带时长
        let c = picture(100.0, 0.04, 1);
        assert_eq!(frame_duration(&a, &c, 10.0), 0.04);

        // 倒退或 NaN：同样退回
        let d = picture(0.5, 0.04, 1);
        assert_eq!(frame_duration(&a, &d, 10.0), 0.04);
        let e = picture(f64::NAN, 0.04, 1);
        assert_eq!(frame_duration(&a, &e, 10.0), 0.04);

        // 跨代为 0
        let f = picture(1.05, 0.04, 2);
        assert_eq!(frame_duration(&a, &f, 10.0), 0.0);
    }

    #[test]
    fn test_audio_drift_warmup_and_clamp() {
        let mut drift = AudioDrift::new(0.001);
        // 预热阶段不做校正
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(drift.wanted_samples(1024, 0.5, 44100), 1024);
        }
        // 预热结束后校正，且不超过 ±10%
        let wanted = drift.wanted_samples(1024, 0.5, 44100);
        assert_eq!(wanted, 1024 * 110 / 100);
        let wanted = drift.wanted_samples(1024, -0.5, 44100);
        assert_eq!(wanted, 1024 * 90 / 100);
    }

    #[test]
    fn test_audio_drift_resets_on_invalid() {
        let mut drift = AudioDrift::new(0.001);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            drift.wanted_samples(1024, 0.5, 44100);
        }
        // 无效偏差重置累积，重新进入预热
        assert_eq!(drift.wanted_samples(1024, f64::NAN, 44100), 1024);
        assert_eq!(drift.wanted_samples(1024, 0.5, 44100), 1024);
    }

    #[test]
    fn test_external_speed_bounds() {
        let mut speed = 1.0;
        for _ in 0..500 {
            speed = adapted_external_speed(speed, Some(0), Some(0));
        }
        assert!((speed - EXTERNAL_CLOCK_SPEED_MIN).abs() < 1e-9);

        for _ in 0..500 {
            speed = adapted_external_speed(speed, Some(100), Some(100));
        }
        assert!((speed - EXTERNAL_CLOCK_SPEED_MAX).abs() < 1e-9);
    }

    #[test]
    fn test_external_speed_drifts_back_to_unity() {
        let mut speed = 0.95;
        for _ in 0..200 {
            speed = adapted_external_speed(speed, Some(5), Some(5));
        }
        assert!((speed - 1.0).abs() < 0.01, "speed={speed}");
    }

    #[test]
    fn test_packet_in_play_range() {
        let tb = Rational::new(1, 1000);
        // 未限制时长：全部在区间内
        assert!(packet_in_play_range(None, None, Some(999_999), None, tb));
        // 2 秒时长限制，1.5 秒处的包在区间内
        assert!(packet_in_play_range(
            Some(2_000_000),
            None,
            Some(1500),
            Some(0),
            tb
        ));
        // 2.5 秒处的包超出
        assert!(!packet_in_play_range(
            Some(2_000_000),
            None,
            Some(2500),
            Some(0),
            tb
        ));
        // start_time 前移播放区间
        assert!(packet_in_play_range(
            Some(2_000_000),
            Some(1_000_000),
            Some(2500),
            Some(0),
            tb
        ));
    }

    #[test]
    fn test_stepped_volume() {
        let max = 128;
        let up = stepped_volume(64, max, 1, 0.75);
        assert!(up > 64 && up <= max);
        let down = stepped_volume(64, max, -1, 0.75);
        assert!(down < 64);
        // 静音向上至少 +1，且不越界
        assert!(stepped_volume(0, max, 1, 0.75) >= 1);
        assert_eq!(stepped_volume(max, max, 1, 0.75).min(max), max);
        assert_eq!(stepped_volume(0, max, -1, 0.75), 0);
    }
}
