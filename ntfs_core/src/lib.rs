//! ntfs_core: Pure Rust NTFS 3.x on-disk core
//!
//! 这是一个纯 Rust 实现的 NTFS 读写核心，覆盖：
//! - **簇 / MFT 记录分配**（窗口化位图 + 空闲 extent 索引）
//! - **runs 引擎**（VCN → LCN 映射与 NTFS 变长编码）
//! - **MFT 记录与属性引擎**（常驻 / 非常驻、$ATTRIBUTE_LIST 溢出）
//! - **B+ 树索引引擎**（目录 $I30、$SII/$SDH 等）
//!
//! VFS 适配、LZNT 编解码、NLS 转换、$LogFile 重放策略属于
//! 外层协作者，核心只暴露它们需要的接口（块设备抽象与
//! 重放门禁）。
//!
//! # 示例
//!
//! ```rust,ignore
//! use ntfs_core::{BlockDevice, BlockDev, Ntfs, MountOptions, Result};
//!
//! struct MyDevice { /* ... */ }
//!
//! impl BlockDevice for MyDevice {
//!     // 实现必要的方法
//!     // ...
//! }
//!
//! fn main() -> Result<()> {
//!     let bdev = BlockDev::new(MyDevice::open("/dev/sdb1")?);
//!     let mut fs = Ntfs::mount(bdev, MountOptions::default())?;
//!     let root = ntfs_core::NtfsInode::load(&mut fs, ntfs_core::consts::MFT_REC_ROOT)?;
//!     Ok(())
//! }
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量与基础类型别名
pub mod consts;

/// 磁盘结构
pub mod types;

/// fixup 数组
pub mod fixup;

/// NTFS 时间转换
pub mod time;

/// $UpCase 文件名比较
pub mod upcase;

/// 块设备抽象
pub mod block;

/// runs 树
pub mod run;

/// 窗口化位图
pub mod bitmap;

/// MFT 记录引擎
pub mod record;

/// $ATTRIBUTE_LIST
pub mod attrlist;

/// inode 门面
pub mod inode;

/// B+ 树索引引擎
pub mod index;

/// 卷级状态、挂载与分配器
pub mod fs;

/// EA 存储与 xattr 命名空间
pub mod xattr;

/// $Secure：安全描述符存储
pub mod security;

/// 挂载选项
pub mod options;

// ===== 公共导出 =====

pub use block::{BlockDev, BlockDevice, DeviceLock, NoLock, SpinLock};
pub use consts::CLST;
pub use error::{Error, ErrorKind, Result};
pub use fs::{AllocateOpt, Ntfs, NtfsFlags, NtfsState};
pub use inode::NtfsInode;
pub use index::{Finder, NtfsIndex};
pub use options::MountOptions;
pub use run::{NtfsRun, RunsTree};
pub use types::MftRef;
