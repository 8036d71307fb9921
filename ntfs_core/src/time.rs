//! NTFS 时间转换
//!
//! NTFS 时间 = 自 1601-01-01 UTC 起的 100ns 间隔数。
//! 对应 ntfs3 的 `kernel2nt()` / `nt2kernel()`。

/// 一秒包含的 100ns 间隔数
const UNITS_PER_SECOND: u64 = 10_000_000;

/// 1601-01-01 到 1970-01-01 的秒数
const SECONDS_1601_TO_1970: u64 = 0x0000_0002_B610_9100;

/// NTFS 时间粒度（纳秒）
pub const NTFS_TIME_GRAN: u32 = 100;

/// 秒 + 纳秒表示的时间戳
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

/// unix 时间戳转 NTFS 时间
#[inline]
pub fn kernel2nt(ts: &Timespec) -> u64 {
    UNITS_PER_SECOND * (ts.sec + SECONDS_1601_TO_1970) + (ts.nsec / NTFS_TIME_GRAN) as u64
}

/// NTFS 时间转 unix 时间戳
#[inline]
pub fn nt2kernel(nt: u64) -> Timespec {
    let t = nt - UNITS_PER_SECOND * SECONDS_1601_TO_1970;
    Timespec {
        sec: t / UNITS_PER_SECOND,
        nsec: ((t % UNITS_PER_SECOND) as u32) * NTFS_TIME_GRAN,
    }
}
