use std::ffi::CString;
use std::os::raw::c_void;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::{ffi, filter, format, frame, ChannelLayout, Rational};
use log::{debug, warn};

use crate::core::{AudioParams, PlayerError, Result};
use crate::player::options::{AudioStreamOptions, VideoStreamOptions};

fn find_filter(name: &str) -> Result<filter::Filter> {
    filter::find(name).ok_or_else(|| PlayerError::FilterError(format!("找不到滤镜 {name}")))
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| PlayerError::FilterError("滤镜参数包含 NUL".into()))
}

/// 在 buffersink 上设置整型列表约束（pix_fmts/color_spaces 等二进制选项）
fn set_sink_int_list(sink: &mut filter::Context, name: &str, values: &[i32]) -> Result<()> {
    let name_c = cstring(name)?;
    let ret = unsafe {
        ffi::av_opt_set_bin(
            sink.as_mut_ptr() as *mut c_void,
            name_c.as_ptr(),
            values.as_ptr() as *const u8,
            std::mem::size_of_val(values) as i32,
            ffi::AV_OPT_SEARCH_CHILDREN,
        )
    };
    if ret < 0 {
        return Err(PlayerError::FilterError(format!("设置 {name} 失败")));
    }
    Ok(())
}

fn set_sink_int(sink: &mut filter::Context, name: &str, value: i64) -> Result<()> {
    let name_c = cstring(name)?;
    let ret = unsafe {
        ffi::av_opt_set_int(
            sink.as_mut_ptr() as *mut c_void,
            name_c.as_ptr(),
            value,
            ffi::AV_OPT_SEARCH_CHILDREN,
        )
    };
    if ret < 0 {
        return Err(PlayerError::FilterError(format!("设置 {name} 失败")));
    }
    Ok(())
}

fn sample_fmt_name(fmt: format::Sample) -> String {
    unsafe {
        let name = ffi::av_get_sample_fmt_name(fmt.into());
        if name.is_null() {
            "none".to_string()
        } else {
            std::ffi::CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }
}

/// 从 display matrix 侧数据中还原旋转角（度）。矩阵退化时为 NaN
fn display_rotation(matrix: &[i32; 9]) -> f64 {
    let to_f = |x: i32| x as f64 / 65536.0;
    let scale0 = f64::hypot(to_f(matrix[0]), to_f(matrix[3]));
    let scale1 = f64::hypot(to_f(matrix[1]), to_f(matrix[4]));
    if scale0 == 0.0 || scale1 == 0.0 {
        return f64::NAN;
    }
    let rotation = (to_f(matrix[1]) / scale1)
        .atan2(to_f(matrix[0]) / scale0)
        .to_degrees();
    -rotation
}

/// 归一化到 [0, 360) 的旋转角；偏离 90° 整数倍超过 2° 时告警
pub(crate) fn normalized_rotation(matrix: Option<&[i32; 9]>) -> f64 {
    let mut theta = match matrix {
        Some(m) => {
            let r = display_rotation(m);
            if r.is_nan() {
                0.0
            } else {
                -r.round()
            }
        }
        None => 0.0,
    };
    theta -= 360.0 * (theta / 360.0 + 0.9 / 360.0).floor();
    if (theta - 90.0 * (theta / 90.0).round()).abs() > 2.0 {
        warn!("非常规旋转角度 {:.2}°", theta);
    }
    theta
}

/// 由旋转角生成滤镜链片段。角度按 ±1° 容差对齐到 90/180/270
pub(crate) fn rotation_filters(matrix: Option<&[i32; 9]>) -> Vec<String> {
    let mut filters = Vec::new();
    let theta = normalized_rotation(matrix);
    let Some(m) = matrix else {
        return filters;
    };
    if (theta - 90.0).abs() < 1.0 {
        filters.push(format!(
            "transpose={}",
            if m[3] > 0 { "cclock_flip" } else { "clock" }
        ));
    } else if (theta - 180.0).abs() < 1.0 {
        if m[0] < 0 {
            filters.push("hflip".to_string());
        }
        if m[4] < 0 {
            filters.push("vflip".to_string());
        }
    } else if (theta - 270.0).abs() < 1.0 {
        filters.push(format!(
            "transpose={}",
            if m[3] < 0 { "clock_flip" } else { "cclock" }
        ));
    } else if theta.abs() > 1.0 {
        filters.push(format!("rotate={theta}*PI/180"));
    } else if m[4] < 0 {
        filters.push("vflip".to_string());
    }
    filters
}

pub(crate) fn matrix_from_bytes(data: &[u8]) -> Option<[i32; 9]> {
    if data.len() < 36 {
        return None;
    }
    let mut matrix = [0i32; 9];
    for (i, chunk) in data.chunks_exact(4).take(9).enumerate() {
        matrix[i] = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(matrix)
}

/// 视频滤镜图：buffer 源 → 用户滤镜 → 自动旋转 → buffersink
pub(crate) struct VideoFilterGraph {
    graph: filter::Graph,
    time_base: Rational,
    frame_rate: Rational,
}

impl VideoFilterGraph {
    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    pub fn push(&mut self, frame: &frame::Video) -> Result<()> {
        self.graph
            .get("in")
            .ok_or(PlayerError::FilterError("buffer 源缺失".into()))?
            .source()
            .add(frame)
            .map_err(Into::into)
    }

    pub fn pull(&mut self, frame: &mut frame::Video) -> std::result::Result<(), ffmpeg::Error> {
        match self.graph.get("out") {
            Some(mut sink) => sink.sink().frame(frame),
            None => Err(ffmpeg::Error::Bug),
        }
    }
}

pub(crate) fn configure_video_graph(
    frame: &frame::Video,
    time_base: Rational,
    sample_aspect_ratio: Rational,
    frame_rate: Rational,
    stream_display_matrix: Option<[i32; 9]>,
    opts: &VideoStreamOptions,
) -> Result<VideoFilterGraph> {
    let mut graph = filter::Graph::new();
    unsafe {
        (*graph.as_mut_ptr()).nb_threads = opts.filter_nb_threads;
    }
    if !opts.sws_opts.is_empty() {
        let joined = opts
            .sws_opts
            .iter()
            .map(|(k, v)| {
                let key = if k == "sws_flags" { "flags" } else { k.as_str() };
                format!("{key}={v}")
            })
            .collect::<Vec<_>>()
            .join(":");
        let joined_c = cstring(&joined)?;
        unsafe {
            (*graph.as_mut_ptr()).scale_sws_opts = ffi::av_strdup(joined_c.as_ptr());
        }
    }

    let pix_fmt = ffi::AVPixelFormat::from(frame.format()) as i32;
    let colorspace = ffi::AVColorSpace::from(frame.color_space()) as i32;
    let range = ffi::AVColorRange::from(frame.color_range()) as i32;
    let mut args = format!(
        "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}:colorspace={}:range={}",
        frame.width(),
        frame.height(),
        pix_fmt,
        time_base.numerator(),
        time_base.denominator(),
        sample_aspect_ratio.numerator(),
        sample_aspect_ratio.denominator().max(1),
        colorspace,
        range,
    );
    if frame_rate.numerator() != 0 && frame_rate.denominator() != 0 {
        args.push_str(&format!(
            ":frame_rate={}/{}",
            frame_rate.numerator(),
            frame_rate.denominator()
        ));
    }
    graph.add(&find_filter("buffer")?, "in", &args)?;
    graph.add(&find_filter("buffersink")?, "out", "")?;
    {
        let mut sink = graph
            .get("out")
            .ok_or(PlayerError::FilterError("buffersink 缺失".into()))?;
        if !opts.pix_fmts.is_empty() {
            let list: Vec<i32> = opts
                .pix_fmts
                .iter()
                .map(|p| ffi::AVPixelFormat::from(*p) as i32)
                .collect();
            set_sink_int_list(&mut sink, "pix_fmts", &list)?;
        }
        if !opts.color_spaces.is_empty() {
            let list: Vec<i32> = opts
                .color_spaces
                .iter()
                .map(|s| ffi::AVColorSpace::from(*s) as i32)
                .collect();
            set_sink_int_list(&mut sink, "color_spaces", &list)?;
        }
    }

    let mut chain: Vec<String> = Vec::new();
    if let Some(user) = opts.filters.as_deref() {
        if !user.is_empty() {
            chain.push(user.to_string());
        }
    }
    if opts.autorotate {
        let frame_matrix = frame
            .side_data(frame::side_data::Type::DisplayMatrix)
            .and_then(|sd| matrix_from_bytes(sd.data()));
        let matrix = frame_matrix.or(stream_display_matrix);
        chain.extend(rotation_filters(matrix.as_ref()));
    }
    let spec = if chain.is_empty() {
        "null".to_string()
    } else {
        chain.join(",")
    };
    debug!("视频滤镜链: {spec}");
    graph.output("in", 0)?.input("out", 0)?.parse(&spec)?;
    graph.validate()?;

    let (time_base, frame_rate) = {
        let mut sink = graph
            .get("out")
            .ok_or(PlayerError::FilterError("buffersink 缺失".into()))?;
        unsafe {
            let ptr = sink.as_mut_ptr();
            (
                Rational::from(ffi::av_buffersink_get_time_base(ptr)),
                Rational::from(ffi::av_buffersink_get_frame_rate(ptr)),
            )
        }
    };
    Ok(VideoFilterGraph {
        graph,
        time_base,
        frame_rate,
    })
}

/// 音频滤镜图：abuffer 源 → 用户滤镜 → S16 输出的 abuffersink
pub(crate) struct AudioFilterGraph {
    graph: filter::Graph,
    time_base: Rational,
}

impl AudioFilterGraph {
    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn push(&mut self, frame: &frame::Audio) -> Result<()> {
        self.graph
            .get("in")
            .ok_or(PlayerError::FilterError("abuffer 源缺失".into()))?
            .source()
            .add(frame)
            .map_err(Into::into)
    }

    pub fn pull(&mut self, frame: &mut frame::Audio) -> std::result::Result<(), ffmpeg::Error> {
        match self.graph.get("out") {
            Some(mut sink) => sink.sink().frame(frame),
            None => Err(ffmpeg::Error::Bug),
        }
    }

    /// sink 实际协商出的采样率
    pub fn sink_sample_rate(&mut self) -> u32 {
        match self.graph.get("out") {
            Some(mut sink) => unsafe { ffi::av_buffersink_get_sample_rate(sink.as_mut_ptr()) as u32 },
            None => 0,
        }
    }

    /// sink 实际协商出的声道布局
    pub fn sink_channel_layout(&mut self) -> ChannelLayout {
        let Some(mut sink) = self.graph.get("out") else {
            return ChannelLayout::STEREO;
        };
        unsafe {
            let ptr = sink.as_mut_ptr();
            let mut layout: ffi::AVChannelLayout = std::mem::zeroed();
            if ffi::av_buffersink_get_ch_layout(ptr, &mut layout) < 0 {
                return ChannelLayout::STEREO;
            }
            let channels = layout.nb_channels;
            let mask = if layout.order == ffi::AVChannelOrder::AV_CHANNEL_ORDER_NATIVE {
                layout.u.mask
            } else {
                0
            };
            ffi::av_channel_layout_uninit(&mut layout);
            if mask != 0 {
                ChannelLayout::from_bits_truncate(mask)
            } else {
                ChannelLayout::default(channels)
            }
        }
    }
}

pub(crate) fn configure_audio_graph(
    source: &AudioParams,
    target: &AudioParams,
    force_output_format: bool,
    opts: &AudioStreamOptions,
) -> Result<AudioFilterGraph> {
    let mut graph = filter::Graph::new();
    unsafe {
        (*graph.as_mut_ptr()).nb_threads = opts.filter_nb_threads;
    }
    if !opts.swr_opts.is_empty() {
        let joined = opts
            .swr_opts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(":");
        let key = cstring("aresample_swr_opts")?;
        let val = cstring(&joined)?;
        unsafe {
            ffi::av_opt_set(graph.as_mut_ptr() as *mut c_void, key.as_ptr(), val.as_ptr(), 0);
        }
    }

    let args = format!(
        "sample_rate={}:sample_fmt={}:time_base=1/{}:channel_layout=0x{:x}",
        source.freq,
        sample_fmt_name(source.format),
        source.freq,
        source.channel_layout.bits(),
    );
    graph.add(&find_filter("abuffer")?, "in", &args)?;
    graph.add(&find_filter("abuffersink")?, "out", "")?;
    {
        let mut sink = graph
            .get("out")
            .ok_or(PlayerError::FilterError("abuffersink 缺失".into()))?;
        sink.set_sample_format(format::Sample::I16(format::sample::Type::Packed));
        if force_output_format {
            set_sink_int(&mut sink, "all_channel_counts", 0)?;
            sink.set_channel_layout(target.channel_layout);
            sink.set_sample_rate(target.freq);
        } else {
            set_sink_int(&mut sink, "all_channel_counts", 1)?;
        }
    }

    let spec = match opts.filters.as_deref() {
        Some(user) if !user.is_empty() => user.to_string(),
        _ => "anull".to_string(),
    };
    debug!("音频滤镜链: {spec}");
    graph.output("in", 0)?.input("out", 0)?.parse(&spec)?;
    graph.validate()?;

    let time_base = {
        let mut sink = graph
            .get("out")
            .ok_or(PlayerError::FilterError("abuffersink 缺失".into()))?;
        unsafe { Rational::from(ffi::av_buffersink_get_time_base(sink.as_mut_ptr())) }
    };
    Ok(AudioFilterGraph { graph, time_base })
}

#[cfg(test)]
mod tests {
    use super::*;

    // 16.16 定点
    const ONE: i32 = 1 << 16;

    fn rotation_matrix(degrees: f64) -> [i32; 9] {
        let rad = degrees.to_radians();
        let c = (rad.cos() * 65536.0) as i32;
        let s = (rad.sin() * 65536.0) as i32;
        [c, s, 0, -s, c, 0, 0, 0, ONE]
    }

    #[test]
    fn test_rotation_identity() {
        let m = rotation_matrix(0.0);
        assert_eq!(normalized_rotation(Some(&m)), 0.0);
        assert!(rotation_filters(Some(&m)).is_empty());
    }

    #[test]
    fn test_rotation_snaps_to_quadrants() {
        for (deg, expected) in [(90.0, 90.0), (180.0, 180.0), (270.0, 270.0)] {
            let m = rotation_matrix(deg);
            let theta = normalized_rotation(Some(&m));
            assert!(
                (theta - expected).abs() < 1.0,
                "deg={deg} theta={theta} expected={expected}"
            );
        }
    }

    #[test]
    fn test_rotation_filters_by_quadrant() {
        let filters = rotation_filters(Some(&rotation_matrix(90.0)));
        assert_eq!(filters.len(), 1);
        assert!(filters[0].starts_with("transpose="), "{:?}", filters);

        let filters = rotation_filters(Some(&rotation_matrix(270.0)));
        assert_eq!(filters.len(), 1);
        assert!(filters[0].starts_with("transpose="), "{:?}", filters);

        // 任意角度走 rotate
        let filters = rotation_filters(Some(&rotation_matrix(45.0)));
        assert_eq!(filters.len(), 1);
        assert!(filters[0].starts_with("rotate="), "{:?}", filters);
    }

    #[test]
    fn test_rotation_180_flips() {
        // 180° = 水平 + 垂直翻转
        let m = rotation_matrix(180.0);
        let filters = rotation_filters(Some(&m));
        assert!(filters.contains(&"hflip".to_string()), "{:?}", filters);
        assert!(filters.contains(&"vflip".to_string()), "{:?}", filters);
    }

    #[test]
    fn test_vflip_without_rotation() {
        // 单纯的垂直镜像：m[4] < 0 且角度为 0
        let m = [ONE, 0, 0, 0, -ONE, 0, 0, 0, ONE];
        let filters = rotation_filters(Some(&m));
        assert_eq!(filters, vec!["vflip".to_string()]);
    }

    #[test]
    fn test_no_matrix_no_filters() {
        assert!(rotation_filters(None).is_empty());
        assert_eq!(normalized_rotation(None), 0.0);
    }

    #[test]
    fn test_matrix_from_bytes() {
        let m = rotation_matrix(90.0);
        let mut bytes = Vec::new();
        for v in m {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        assert_eq!(matrix_from_bytes(&bytes), Some(m));
        assert_eq!(matrix_from_bytes(&bytes[..20]), None);
    }
}
