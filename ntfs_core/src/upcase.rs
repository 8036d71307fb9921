//! 文件名比较（$UpCase 表）
//!
//! NTFS 目录项按大小写折叠后的 UTF-16 排序；POSIX 命名空间的
//! 项在折叠后相等时再按原字节序比较。对应 ntfs3 的
//! `ntfs_cmp_names()` / `ntfs_cmp_names_cpu()`。

use alloc::vec::Vec;
use core::cmp::Ordering;

/// $UpCase 表的项数（覆盖整个 UTF-16 基本平面）
pub const UPCASE_LEN: usize = 0x10000;

/// 按表折叠单个字符
#[inline]
pub fn upcase_chr(upcase: &[u16], c: u16) -> u16 {
    match upcase.get(c as usize) {
        Some(&u) => u,
        None => c,
    }
}

/// 比较两个 UTF-16 名字
///
/// `bothcase` 为 true 时，大小写折叠相等的名字再按原字节序
/// 决出次序（POSIX 名字需要这个行为）；为 false 时折叠相等即相等。
pub fn cmp_names(s1: &[u16], s2: &[u16], upcase: &[u16], bothcase: bool) -> Ordering {
    let len = s1.len().min(s2.len());

    for i in 0..len {
        let u1 = upcase_chr(upcase, s1[i]);
        let u2 = upcase_chr(upcase, s2[i]);
        match u1.cmp(&u2) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    match s1.len().cmp(&s2.len()) {
        Ordering::Equal => {}
        other => return other,
    }

    if bothcase {
        // 折叠后相等，逐字符精确比较
        for i in 0..len {
            match s1[i].cmp(&s2[i]) {
                Ordering::Equal => {}
                other => return other,
            }
        }
    }
    Ordering::Equal
}

/// 生成缺省 $UpCase 表（恒等映射 + ASCII / Latin-1 大写折叠）
///
/// 卷上的 $UpCase 读取失败或测试环境下使用。
pub fn generate_default_upcase() -> Vec<u16> {
    let mut tbl: Vec<u16> = (0..UPCASE_LEN as u32).map(|c| c as u16).collect();

    for c in b'a'..=b'z' {
        tbl[c as usize] = (c - b'a' + b'A') as u16;
    }
    // Latin-1 小写区（0xDF sharp-s 和 0xF7 除号除外）
    for c in 0xE0u16..=0xFE {
        if c != 0xF7 {
            tbl[c as usize] = c - 0x20;
        }
    }
    tbl
}

/// UTF-8 字符串转 UTF-16（测试和元文件名用）
pub fn str_to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}
