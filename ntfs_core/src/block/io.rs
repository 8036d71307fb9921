//! 字节寻址 I/O
//!
//! 对应 ntfs3 的 `ntfs_sb_read()` / `ntfs_sb_write()`：任意
//! `(lbo, len)` 范围的读写，自动处理扇区边界。

use super::device::{BlockDev, BlockDevice};
use super::lock::DeviceLock;
use crate::error::{Error, ErrorKind, Result};
use alloc::vec;

impl<D: BlockDevice, L: DeviceLock> BlockDev<D, L> {
    /// 从字节偏移 `lbo` 读 `buf.len()` 字节
    pub fn read_bytes(&mut self, lbo: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let ssize = self.sector_size() as u64;
        if lbo + buf.len() as u64 > self.size_bytes() {
            return Err(Error::new(ErrorKind::Io, "read past end of volume"));
        }

        self.lock().acquire();
        let res = self.read_bytes_locked(lbo, buf, ssize);
        self.lock().release();
        res
    }

    fn read_bytes_locked(&mut self, lbo: u64, buf: &mut [u8], ssize: u64) -> Result<()> {
        let start = lbo / ssize;
        let off = (lbo % ssize) as usize;
        let nsect = (off + buf.len()).div_ceil(ssize as usize);

        self.inc_read_count();

        if off == 0 && buf.len() % ssize as usize == 0 {
            // 对齐快路径，直接读进调用者缓冲区
            return self.device_mut().read_sectors(start, nsect as u32, buf);
        }

        let mut tmp = vec![0u8; nsect * ssize as usize];
        self.device_mut()
            .read_sectors(start, nsect as u32, &mut tmp)?;
        buf.copy_from_slice(&tmp[off..off + buf.len()]);
        Ok(())
    }

    /// 向字节偏移 `lbo` 写 `buf`；`sync` 为 true 时立即落盘
    pub fn write_bytes(&mut self, lbo: u64, buf: &[u8], sync: bool) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let ssize = self.sector_size() as u64;
        if lbo + buf.len() as u64 > self.size_bytes() {
            return Err(Error::new(ErrorKind::Io, "write past end of volume"));
        }
        if self.device().is_read_only() {
            return Err(Error::new(ErrorKind::Io, "device is read-only"));
        }

        self.lock().acquire();
        let res = self.write_bytes_locked(lbo, buf, ssize);
        self.lock().release();
        res?;

        if sync {
            self.device_mut().flush()?;
        }
        Ok(())
    }

    fn write_bytes_locked(&mut self, lbo: u64, buf: &[u8], ssize: u64) -> Result<()> {
        let start = lbo / ssize;
        let off = (lbo % ssize) as usize;
        let nsect = (off + buf.len()).div_ceil(ssize as usize);

        self.inc_write_count();

        if off == 0 && buf.len() % ssize as usize == 0 {
            return self.device_mut().write_sectors(start, nsect as u32, buf);
        }

        // 非对齐：读-改-写
        let mut tmp = vec![0u8; nsect * ssize as usize];
        self.device_mut()
            .read_sectors(start, nsect as u32, &mut tmp)?;
        tmp[off..off + buf.len()].copy_from_slice(buf);
        self.device_mut().write_sectors(start, nsect as u32, &tmp)
    }

    /// 把一段字节范围清零
    pub fn zero_bytes(&mut self, lbo: u64, bytes: u64) -> Result<()> {
        const CHUNK: u64 = 64 * 1024;
        let zeros = vec![0u8; CHUNK.min(bytes) as usize];
        let mut done = 0;
        while done < bytes {
            let n = CHUNK.min(bytes - done) as usize;
            self.write_bytes(lbo + done, &zeros[..n], false)?;
            done += n as u64;
        }
        Ok(())
    }

    /// 刷新设备缓存
    pub fn flush(&mut self) -> Result<()> {
        self.device_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDev;
    use alloc::vec::Vec;

    pub struct MemDevice {
        data: Vec<u8>,
    }

    impl MemDevice {
        pub fn new(sectors: usize) -> Self {
            Self {
                data: vec![0u8; sectors * 512],
            }
        }
    }

    impl BlockDevice for MemDevice {
        fn sector_size(&self) -> u32 {
            512
        }

        fn total_sectors(&self) -> u64 {
            (self.data.len() / 512) as u64
        }

        fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
            let off = lba as usize * 512;
            let len = count as usize * 512;
            buf[..len].copy_from_slice(&self.data[off..off + len]);
            Ok(())
        }

        fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<()> {
            let off = lba as usize * 512;
            let len = count as usize * 512;
            self.data[off..off + len].copy_from_slice(&buf[..len]);
            Ok(())
        }
    }

    #[test]
    fn test_unaligned_round_trip() {
        let mut bdev = BlockDev::new(MemDevice::new(16));

        let data = [0xABu8; 100];
        bdev.write_bytes(700, &data, false).unwrap();

        let mut back = [0u8; 100];
        bdev.read_bytes(700, &mut back).unwrap();
        assert_eq!(back, data);

        // 相邻字节未被破坏
        let mut b = [0u8; 1];
        bdev.read_bytes(699, &mut b).unwrap();
        assert_eq!(b[0], 0);
        bdev.read_bytes(800, &mut b).unwrap();
        assert_eq!(b[0], 0);
    }

    #[test]
    fn test_read_past_end() {
        let mut bdev = BlockDev::new(MemDevice::new(2));
        let mut buf = [0u8; 8];
        assert!(bdev.read_bytes(1020, &mut buf).is_err());
    }

    #[test]
    fn test_zero_bytes() {
        let mut bdev = BlockDev::new(MemDevice::new(8));
        bdev.write_bytes(0, &[0xFF; 4096], false).unwrap();
        bdev.zero_bytes(100, 1000).unwrap();

        let mut buf = [0u8; 1002];
        bdev.read_bytes(99, &mut buf).unwrap();
        assert_eq!(buf[0], 0xFF);
        assert!(buf[1..1001].iter().all(|&b| b == 0));
        assert_eq!(buf[1001], 0xFF);
    }

    #[test]
    fn test_counters() {
        let mut bdev = BlockDev::new(MemDevice::new(4));
        let mut buf = [0u8; 512];
        bdev.read_bytes(0, &mut buf).unwrap();
        bdev.write_bytes(0, &buf, false).unwrap();
        assert_eq!(bdev.read_count(), 1);
        assert_eq!(bdev.write_count(), 1);
    }
}
