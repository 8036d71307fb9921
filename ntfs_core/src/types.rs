//! NTFS 核心数据结构
//!
//! 设计原则：
//! 1. 命名对照 ntfs3 的 C 定义（结构体名、字段名）
//! 2. 所有磁盘结构经带界检查的切片访问器解码，不做指针转写
//! 3. 小端存储，访问器负责字节序

use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};
use crate::time::Timespec;
use alloc::vec::Vec;
use bitflags::bitflags;

// ===== 带界检查的小端访问器 =====

#[inline]
pub fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// 读 UTF-16LE 名字
pub fn get_utf16(buf: &[u8], off: usize, len: usize) -> Vec<u16> {
    (0..len).map(|i| get_u16(buf, off + i * 2)).collect()
}

/// 写 UTF-16LE 名字
pub fn put_utf16(buf: &mut [u8], off: usize, name: &[u16]) {
    for (i, &c) in name.iter().enumerate() {
        put_u16(buf, off + i * 2, c);
    }
}

// ===== MFT_REF =====

/// `(记录号, 序列号)` 对，磁盘上打包成 u64
///
/// 序列号 0 是"已删除"标记。本实现不支持 64 位簇号，
/// 有效引用的 high 16 位必须为 0。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MftRef {
    pub rno: CLST,
    pub seq: u16,
}

impl MftRef {
    pub fn new(rno: CLST, seq: u16) -> Self {
        Self { rno, seq }
    }

    pub fn from_u64(v: u64) -> Result<Self> {
        if (v >> 32) & 0xFFFF != 0 {
            return Err(Error::new(ErrorKind::Unsupported, "64-bit MFT_REF"));
        }
        Ok(Self {
            rno: v as u32,
            seq: (v >> 48) as u16,
        })
    }

    pub fn to_u64(self) -> u64 {
        self.rno as u64 | ((self.seq as u64) << 48)
    }
}

// ===== 文件属性位（$STANDARD_INFORMATION.fa）=====

bitflags! {
    /// FILE_ATTRIBUTE_XXX
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttr: u32 {
        const READONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const ARCHIVE = 0x0020;
        const DEVICE = 0x0040;
        const NORMAL = 0x0080;
        const TEMPORARY = 0x0100;
        const SPARSE_FILE = 0x0200;
        const REPARSE_POINT = 0x0400;
        const COMPRESSED = 0x0800;
        const OFFLINE = 0x1000;
        const NOT_CONTENT_INDEXED = 0x2000;
        const ENCRYPTED = 0x4000;
        /// 目录（$FILE_NAME.dup.fa 内部使用）
        const DIRECTORY = 0x1000_0000;
    }
}

// ===== $STANDARD_INFORMATION =====

/// v1 大小 0x30，v5（ntfs 3.x）大小 0x48
pub const SIZEOF_STD_INFO: usize = 0x30;
pub const SIZEOF_STD_INFO5: usize = 0x48;

/// 对应 ntfs3 的 `struct ATTR_STD_INFO` / `ATTR_STD_INFO5`
#[derive(Debug, Clone, Copy, Default)]
pub struct StdInfo {
    pub cr_time: u64,
    pub m_time: u64,
    pub c_time: u64,
    pub a_time: u64,
    pub fa: FileAttr,
    pub max_ver_num: u32,
    pub ver_num: u32,
    pub class_id: u32,
    /// 以下仅 v5
    pub owner_id: u32,
    pub security_id: u32,
    pub quota_charge: u64,
    pub usn: u64,
}

impl StdInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SIZEOF_STD_INFO {
            return Err(Error::new(ErrorKind::Corrupted, "std_info too short"));
        }
        let mut std = Self {
            cr_time: get_u64(buf, 0x00),
            m_time: get_u64(buf, 0x08),
            c_time: get_u64(buf, 0x10),
            a_time: get_u64(buf, 0x18),
            fa: FileAttr::from_bits_retain(get_u32(buf, 0x20)),
            max_ver_num: get_u32(buf, 0x24),
            ver_num: get_u32(buf, 0x28),
            class_id: get_u32(buf, 0x2C),
            ..Default::default()
        };
        if buf.len() >= SIZEOF_STD_INFO5 {
            std.owner_id = get_u32(buf, 0x30);
            std.security_id = get_u32(buf, 0x34);
            std.quota_charge = get_u64(buf, 0x38);
            std.usn = get_u64(buf, 0x40);
        }
        Ok(std)
    }

    /// 编码；`v5` 决定写 0x30 还是 0x48 字节
    pub fn to_bytes(&self, v5: bool) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; if v5 { SIZEOF_STD_INFO5 } else { SIZEOF_STD_INFO }];
        put_u64(&mut buf, 0x00, self.cr_time);
        put_u64(&mut buf, 0x08, self.m_time);
        put_u64(&mut buf, 0x10, self.c_time);
        put_u64(&mut buf, 0x18, self.a_time);
        put_u32(&mut buf, 0x20, self.fa.bits());
        put_u32(&mut buf, 0x24, self.max_ver_num);
        put_u32(&mut buf, 0x28, self.ver_num);
        put_u32(&mut buf, 0x2C, self.class_id);
        if v5 {
            put_u32(&mut buf, 0x30, self.owner_id);
            put_u32(&mut buf, 0x34, self.security_id);
            put_u64(&mut buf, 0x38, self.quota_charge);
            put_u64(&mut buf, 0x40, self.usn);
        }
        buf
    }

    pub fn times(&self) -> (Timespec, Timespec, Timespec, Timespec) {
        (
            crate::time::nt2kernel(self.cr_time),
            crate::time::nt2kernel(self.m_time),
            crate::time::nt2kernel(self.c_time),
            crate::time::nt2kernel(self.a_time),
        )
    }
}

// ===== $FILE_NAME =====

/// 名字之前的定长部分
pub const SIZEOF_FILE_NAME: usize = 0x42;

/// 父目录冗余信息（$FILE_NAME 内嵌，目录项里再抄一份）
///
/// 对应 ntfs3 的 `struct NTFS_DUP_INFO`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DupInfo {
    pub cr_time: u64,
    pub m_time: u64,
    pub c_time: u64,
    pub a_time: u64,
    pub alloc_size: u64,
    pub data_size: u64,
    pub fa: FileAttr,
    /// EA 打包尺寸或 reparse tag
    pub ea_size_or_reparse: u32,
}

/// 对应 ntfs3 的 `struct ATTR_FILE_NAME`
#[derive(Debug, Clone, Default)]
pub struct FileName {
    pub home: MftRef,
    pub dup: DupInfo,
    pub name_type: u8,
    pub name: Vec<u16>,
}

impl FileName {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SIZEOF_FILE_NAME {
            return Err(Error::new(ErrorKind::Corrupted, "file_name too short"));
        }
        let name_len = buf[0x40] as usize;
        if buf.len() < SIZEOF_FILE_NAME + name_len * 2 {
            return Err(Error::new(ErrorKind::Corrupted, "file_name name overflow"));
        }
        Ok(Self {
            home: MftRef::from_u64(get_u64(buf, 0x00))?,
            dup: DupInfo {
                cr_time: get_u64(buf, 0x08),
                m_time: get_u64(buf, 0x10),
                c_time: get_u64(buf, 0x18),
                a_time: get_u64(buf, 0x20),
                alloc_size: get_u64(buf, 0x28),
                data_size: get_u64(buf, 0x30),
                fa: FileAttr::from_bits_retain(get_u32(buf, 0x38)),
                ea_size_or_reparse: get_u32(buf, 0x3C),
            },
            name_type: buf[0x41],
            name: get_utf16(buf, SIZEOF_FILE_NAME, name_len),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; self.size()];
        put_u64(&mut buf, 0x00, self.home.to_u64());
        self.write_dup(&mut buf);
        buf[0x40] = self.name.len() as u8;
        buf[0x41] = self.name_type;
        put_utf16(&mut buf, SIZEOF_FILE_NAME, &self.name);
        buf
    }

    /// 只回写 dup 部分（`indx_update_dup` 用）
    pub fn write_dup(&self, buf: &mut [u8]) {
        put_u64(buf, 0x08, self.dup.cr_time);
        put_u64(buf, 0x10, self.dup.m_time);
        put_u64(buf, 0x18, self.dup.c_time);
        put_u64(buf, 0x20, self.dup.a_time);
        put_u64(buf, 0x28, self.dup.alloc_size);
        put_u64(buf, 0x30, self.dup.data_size);
        put_u32(buf, 0x38, self.dup.fa.bits());
        put_u32(buf, 0x3C, self.dup.ea_size_or_reparse);
    }

    pub fn size(&self) -> usize {
        SIZEOF_FILE_NAME + self.name.len() * 2
    }
}

// ===== $VOLUME_INFORMATION =====

pub const SIZEOF_VOLUME_INFO: usize = 0x0C;

/// 卷脏标志
pub const VOLUME_FLAG_DIRTY: u16 = 0x0001;
/// chkdsk 介入标志，本实现视同 error 态
pub const VOLUME_FLAG_RESIZE_LOG: u16 = 0x0002;

/// 对应 ntfs3 的 `struct VOLUME_INFO`
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeInfo {
    pub major_ver: u8,
    pub minor_ver: u8,
    pub flags: u16,
}

impl VolumeInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SIZEOF_VOLUME_INFO {
            return Err(Error::new(ErrorKind::Corrupted, "volume_info too short"));
        }
        Ok(Self {
            major_ver: buf[0x08],
            minor_ver: buf[0x09],
            flags: get_u16(buf, 0x0A),
        })
    }

    pub fn to_bytes(&self) -> [u8; SIZEOF_VOLUME_INFO] {
        let mut buf = [0u8; SIZEOF_VOLUME_INFO];
        buf[0x08] = self.major_ver;
        buf[0x09] = self.minor_ver;
        put_u16(&mut buf, 0x0A, self.flags);
        buf
    }
}

// ===== 启动扇区 =====

/// 解析后的启动扇区参数
///
/// 对应 ntfs3 的 `struct NTFS_BOOT` 加 `ntfs_init_from_boot()`
/// 里的推导。`record_size` / `index_size` 字段在盘上可以是
/// 负的 log2。
#[derive(Debug, Clone, Copy)]
pub struct NtfsBoot {
    pub sector_size: u32,
    pub cluster_size: u32,
    pub mft_lcn: u64,
    pub mft2_lcn: u64,
    pub record_size: u32,
    pub index_size: u32,
    pub total_sectors: u64,
    pub serial_num: u64,
}

impl NtfsBoot {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let bad = |m| Error::new(ErrorKind::Corrupted, m);

        if buf.len() < 512 {
            return Err(bad("boot sector too short"));
        }
        if &buf[3..11] != b"NTFS    " {
            return Err(bad("bad NTFS OEM id"));
        }

        let sector_size = get_u16(buf, 0x0B) as u32;
        let spc = buf[0x0D] as u32;
        if !is_power_of2(sector_size as u64) || sector_size < 256 {
            return Err(bad("bad bytes_per_sector"));
        }
        if !is_power_of2(spc as u64) {
            return Err(bad("bad sectors_per_cluster"));
        }
        let cluster_size = sector_size * spc;

        let total_sectors = get_u64(buf, 0x28);
        let mft_lcn = get_u64(buf, 0x30);
        let mft2_lcn = get_u64(buf, 0x38);

        // 负值表示 2^(-x) 字节，正值表示簇数
        let decode_size = |v: i8| -> u32 {
            if v < 0 {
                1u32 << (-v as u32)
            } else {
                v as u32 * cluster_size
            }
        };
        let record_size = decode_size(buf[0x40] as i8);
        let index_size = decode_size(buf[0x44] as i8);

        if !is_power_of2(record_size as u64) || record_size < 256 {
            return Err(bad("bad clusters_per_record"));
        }
        if record_size > MAXIMUM_BYTES_PER_MFT {
            return Err(bad("record size too big"));
        }
        if !is_power_of2(index_size as u64) || index_size < 256 {
            return Err(bad("bad clusters_per_index"));
        }

        Ok(Self {
            sector_size,
            cluster_size,
            mft_lcn,
            mft2_lcn,
            record_size,
            index_size,
            total_sectors,
            serial_num: get_u64(buf, 0x48),
        })
    }
}
