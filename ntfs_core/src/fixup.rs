//! fixup 数组（update sequence array）
//!
//! MFT 记录和 INDX 块内的每个扇区末尾 2 字节被换成序列号哨兵，
//! 用来检测撕裂写。对应 ntfs3 的 `ntfs_fix_pre_write()` /
//! `ntfs_fix_post_read()`。
//!
//! 记录头布局（`NTFS_RECORD_HEADER`）：
//! - 0x00 签名（4 字节）
//! - 0x04 fixup 数组偏移（u16）
//! - 0x06 fixup 数组项数（u16，= 扇区数 + 1，首项是序列号本身）

use crate::error::{Error, ErrorKind, Result};

/// 写前变换：递增序列号，保存每个扇区末尾 2 字节并替换为序列号。
///
/// 缓冲区原地修改，因此同一缓冲区不能并发走两条写路径。
/// 返回 false 表示头部不自洽（fixup 数组越界或项数与大小不符），
/// 此时缓冲区未被修改。
pub fn fix_pre_write(buf: &mut [u8], sector_size: usize) -> bool {
    let Some((fo, fn_)) = fixup_bounds(buf, sector_size) else {
        return false;
    };

    // 序列号递增，0 保留作无效值
    let mut sample = u16::from_le_bytes([buf[fo], buf[fo + 1]]).wrapping_add(1);
    if sample == 0 {
        sample = 1;
    }
    buf[fo..fo + 2].copy_from_slice(&sample.to_le_bytes());

    for i in 0..fn_ - 1 {
        let save = fo + 2 + i * 2;
        let tail = (i + 1) * sector_size - 2;
        let val = [buf[tail], buf[tail + 1]];
        buf[save..save + 2].copy_from_slice(&val);
        buf[tail..tail + 2].copy_from_slice(&sample.to_le_bytes());
    }
    true
}

/// 读后变换：校验每个扇区末尾的序列号并恢复被保存的字节。
///
/// `simple` 为 true 时只恢复不校验（用于 chkdsk 已修补过的记录）。
/// 序列号不符说明发生过撕裂写，返回 `Corrupted`。
pub fn fix_post_read(buf: &mut [u8], sector_size: usize, simple: bool) -> Result<()> {
    let (fo, fn_) = fixup_bounds(buf, sector_size)
        .ok_or_else(|| Error::new(ErrorKind::Corrupted, "bad fixup header"))?;

    let sample = [buf[fo], buf[fo + 1]];
    let mut err = Ok(());

    for i in 0..fn_ - 1 {
        let save = fo + 2 + i * 2;
        let tail = (i + 1) * sector_size - 2;

        if !simple && [buf[tail], buf[tail + 1]] != sample {
            err = Err(Error::new(ErrorKind::Corrupted, "fixup mismatch"));
        }
        let val = [buf[save], buf[save + 1]];
        buf[tail..tail + 2].copy_from_slice(&val);
    }
    err
}

/// 解析并验证 fixup 偏移 / 项数，返回 `(offset, count)`
fn fixup_bounds(buf: &[u8], sector_size: usize) -> Option<(usize, usize)> {
    if buf.len() < 8 || sector_size < 256 || buf.len() % sector_size != 0 {
        return None;
    }

    let fo = u16::from_le_bytes([buf[4], buf[5]]) as usize;
    let fn_ = u16::from_le_bytes([buf[6], buf[7]]) as usize;

    // 项数 = 扇区数 + 1
    if fn_ < 2 || fn_ - 1 != buf.len() / sector_size {
        return None;
    }
    // 数组本身不能越过第一个扇区尾
    if fo < 8 || fo % 2 != 0 || fo + fn_ * 2 > sector_size - 2 {
        return None;
    }
    Some((fo, fn_))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(sectors: usize, sector_size: usize) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; sectors * sector_size];
        buf[0..4].copy_from_slice(b"FILE");
        buf[4..6].copy_from_slice(&0x28u16.to_le_bytes());
        buf[6..8].copy_from_slice(&((sectors + 1) as u16).to_le_bytes());
        // 填充可识别的数据
        for (i, b) in buf.iter_mut().enumerate().skip(8) {
            *b = (i % 251) as u8;
        }
        buf
    }

    #[test]
    fn test_fixup_round_trip() {
        let mut buf = sample_record(2, 512);
        let orig = buf.clone();

        assert!(fix_pre_write(&mut buf, 512));
        // 扇区尾部已被替换
        assert_ne!(buf[510..512], orig[510..512]);

        fix_post_read(&mut buf, 512, false).unwrap();
        // 除序列号外全部还原
        assert_eq!(buf[8..], orig[8..]);
    }

    #[test]
    fn test_fixup_detects_torn_write() {
        let mut buf = sample_record(2, 512);
        assert!(fix_pre_write(&mut buf, 512));

        // 模拟只落盘一半：破坏第二个扇区的哨兵
        buf[1022] ^= 0xFF;
        assert!(fix_post_read(&mut buf, 512, false).is_err());
    }

    #[test]
    fn test_fixup_rejects_bad_header() {
        let mut buf = sample_record(2, 512);
        buf[6..8].copy_from_slice(&9u16.to_le_bytes()); // 项数与大小不符
        assert!(!fix_pre_write(&mut buf, 512));
        assert!(fix_post_read(&mut buf, 512, false).is_err());
    }

    #[test]
    fn test_fixup_sequence_increments() {
        let mut buf = sample_record(1, 512);
        assert!(fix_pre_write(&mut buf, 512));
        let s1 = u16::from_le_bytes([buf[0x28], buf[0x29]]);
        fix_post_read(&mut buf, 512, false).unwrap();
        assert!(fix_pre_write(&mut buf, 512));
        let s2 = u16::from_le_bytes([buf[0x28], buf[0x29]]);
        assert_eq!(s2, s1.wrapping_add(1));
    }
}
