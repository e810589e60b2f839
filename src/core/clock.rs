use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// 进程内单调时间（秒），对应 av_gettime_relative
pub fn relative_seconds() -> f64 {
    CLOCK_ORIGIN.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// 把一个 Instant 换算到 relative_seconds 的时间轴上
pub fn instant_seconds(at: Instant) -> f64 {
    let origin = *CLOCK_ORIGIN.get_or_init(Instant::now);
    if at >= origin {
        (at - origin).as_secs_f64()
    } else {
        -((origin - at).as_secs_f64())
    }
}

/// 包队列序列号的只读视图
///
/// 队列每次 flush/start 都会使序列号 +1；时钟持有这个视图，
/// 用来判断自己携带的 PTS 是否还属于当前代（否则读数为 NaN）。
#[derive(Clone)]
pub struct SerialRef(Arc<AtomicI32>);

impl SerialRef {
    pub(crate) fn new(initial: i32) -> Self {
        Self(Arc::new(AtomicI32::new(initial)))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, value: i32) {
        self.0.store(value, Ordering::SeqCst);
    }
}

/// 播放时钟 - 以序列号做过期判定的 PTS 外推器
///
/// 读数公式：pts_drift + now - (now - last_updated) * (1 - speed)，
/// speed = 1 时退化为挂钟时间。暂停时冻结在 pts。
pub struct Clock {
    inner: Mutex<ClockInner>,
    queue_serial: SerialRef,
    // 外部时钟没有配对的包队列，序列号跟随自身
    detached: bool,
}

struct ClockInner {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    serial: i32,
    paused: bool,
}

impl Clock {
    /// 创建与包队列配对的时钟
    pub fn new(queue_serial: SerialRef) -> Self {
        let clock = Self {
            inner: Mutex::new(ClockInner {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: relative_seconds(),
                speed: 1.0,
                serial: -1,
                paused: false,
            }),
            queue_serial,
            detached: false,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    /// 创建独立时钟（外部时钟）：序列号视图跟随自身序列号，永不过期
    pub fn detached() -> Self {
        let clock = Self {
            inner: Mutex::new(ClockInner {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: relative_seconds(),
                speed: 1.0,
                serial: -1,
                paused: false,
            }),
            queue_serial: SerialRef::new(-1),
            detached: true,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    /// 当前读数（秒）。序列号不匹配返回 NaN，暂停时返回冻结的 pts
    pub fn get(&self) -> f64 {
        let inner = self.inner.lock();
        if self.queue_serial.get() != inner.serial {
            return f64::NAN;
        }
        if inner.paused {
            return inner.pts;
        }
        let time = relative_seconds();
        inner.pts_drift + time - (time - inner.last_updated) * (1.0 - inner.speed)
    }

    /// 在指定时刻设置读数
    pub fn set_at(&self, pts: f64, serial: i32, time: f64) {
        let mut inner = self.inner.lock();
        inner.pts = pts;
        inner.last_updated = time;
        inner.pts_drift = pts - time;
        inner.serial = serial;
        if self.detached {
            self.queue_serial.set(serial);
        }
    }

    /// 以当前时刻设置读数
    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, relative_seconds());
    }

    /// 变速。先把当前读数固定下来再改速率，保证时间连续
    pub fn set_speed(&self, speed: f64) {
        let pts = self.get();
        let serial = self.serial();
        self.set(pts, serial);
        self.inner.lock().speed = speed;
    }

    /// 主从同步：从钟读数有效且主钟无效或偏差超过阈值时，采用从钟的值
    pub fn sync_to_slave(&self, slave: &Clock, no_sync_threshold: f64) {
        let clock_val = self.get();
        let slave_val = slave.get();
        if !slave_val.is_nan() && (clock_val.is_nan() || (clock_val - slave_val).abs() > no_sync_threshold) {
            self.set(slave_val, slave.serial());
        }
    }

    pub fn serial(&self) -> i32 {
        self.inner.lock().serial
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    pub fn last_updated(&self) -> f64 {
        self.inner.lock().last_updated
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_serial_reads_nan() {
        let serial = SerialRef::new(1);
        let clock = Clock::new(serial.clone());
        clock.set(5.0, 1);
        assert!((clock.get() - 5.0).abs() < 0.05);

        // 队列换代后时钟读数过期
        serial.set(2);
        assert!(clock.get().is_nan());

        clock.set(7.0, 2);
        assert!((clock.get() - 7.0).abs() < 0.05);
    }

    #[test]
    fn test_paused_clock_freezes() {
        let clock = Clock::new(SerialRef::new(3));
        clock.set(10.0, 3);
        clock.set_paused(true);
        let a = clock.get();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let b = clock.get();
        assert_eq!(a, b);
        assert_eq!(a, 10.0);
    }

    #[test]
    fn test_clock_advances_with_wall_time() {
        let clock = Clock::new(SerialRef::new(0));
        clock.set(1.0, 0);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let v = clock.get();
        assert!(v > 1.0 && v < 1.5, "v={v}");
    }

    #[test]
    fn test_set_speed_is_continuous() {
        let clock = Clock::new(SerialRef::new(0));
        clock.set(2.0, 0);
        let before = clock.get();
        clock.set_speed(0.5);
        let after = clock.get();
        assert!((after - before).abs() < 0.05, "before={before} after={after}");
        assert_eq!(clock.speed(), 0.5);
    }

    #[test]
    fn test_detached_clock_never_stale() {
        let clock = Clock::detached();
        clock.set(3.0, 42);
        assert!((clock.get() - 3.0).abs() < 0.05);
        clock.set(4.0, 43);
        assert!((clock.get() - 4.0).abs() < 0.05);
    }

    #[test]
    fn test_sync_to_slave() {
        let master = Clock::detached();
        let serial = SerialRef::new(1);
        let slave = Clock::new(serial);
        slave.set(20.0, 1);

        // 主钟无效时直接采用从钟
        master.sync_to_slave(&slave, 10.0);
        assert!((master.get() - 20.0).abs() < 0.05);

        // 偏差小于阈值时不跟随
        slave.set(21.0, 1);
        master.sync_to_slave(&slave, 10.0);
        assert!((master.get() - 20.0).abs() < 0.1);

        // 偏差超过阈值时跟随
        slave.set(100.0, 1);
        master.sync_to_slave(&slave, 10.0);
        assert!((master.get() - 100.0).abs() < 0.05);
    }
}
