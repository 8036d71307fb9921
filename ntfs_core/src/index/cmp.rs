//! 索引键比较
//!
//! 每个索引实例带一个排序规则（$INDEX_ROOT.rule）；文件名键
//! 走 upcase 感知的 UTF-16 比较，其余是定长整数 / 不透明键。
//! 对应 ntfs3 的 `cmp_fnames()` / `cmp_uint()` / `cmp_sdh()` 等。

use crate::consts::*;
use crate::types::get_u32;
use crate::upcase::cmp_names;
use core::cmp::Ordering;

/// 比较两个键
///
/// `k1`/`k2` 是磁盘上的键字节；文件名键是 ATTR_FILE_NAME 的
/// 镜像（名字长度在 0x40，字符从 0x42 起）。
pub fn cmp_keys(rule: u32, upcase: &[u16], k1: &[u8], k2: &[u8]) -> Ordering {
    match rule {
        NTFS_COLLATION_TYPE_FILENAME => cmp_fname_keys(upcase, k1, k2),
        NTFS_COLLATION_TYPE_UINT => cmp_uint(k1, k2),
        NTFS_COLLATION_TYPE_SECURITY_HASH => {
            // SECURITY_KEY { hash, id }
            let h1 = get_u32(k1, 0);
            let h2 = get_u32(k2, 0);
            h1.cmp(&h2).then_with(|| get_u32(k1, 4).cmp(&get_u32(k2, 4)))
        }
        NTFS_COLLATION_TYPE_UINTS => {
            // u32 序列，逐字比较
            let n1 = k1.len() / 4;
            let n2 = k2.len() / 4;
            for i in 0..n1.min(n2) {
                match get_u32(k1, i * 4).cmp(&get_u32(k2, i * 4)) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            n1.cmp(&n2)
        }
        // BINARY、SID 等都是逐字节
        _ => k1.cmp(k2),
    }
}

fn cmp_fname_keys(upcase: &[u16], k1: &[u8], k2: &[u8]) -> Ordering {
    let n1 = fname_of(k1);
    let n2 = fname_of(k2);
    cmp_names(&n1, &n2, upcase, true)
}

/// 从 ATTR_FILE_NAME 键里取名字
pub fn fname_of(key: &[u8]) -> alloc::vec::Vec<u16> {
    if key.len() < 0x42 {
        return alloc::vec::Vec::new();
    }
    let len = (key[0x40] as usize).min((key.len() - 0x42) / 2);
    crate::types::get_utf16(key, 0x42, len)
}

fn cmp_uint(k1: &[u8], k2: &[u8]) -> Ordering {
    if k1.len() >= 4 && k2.len() >= 4 {
        get_u32(k1, 0).cmp(&get_u32(k2, 0))
    } else {
        k1.cmp(k2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileName, MftRef};
    use crate::upcase::{generate_default_upcase, str_to_utf16};

    fn key_for(name: &str) -> alloc::vec::Vec<u8> {
        FileName {
            home: MftRef::new(5, 5),
            name: str_to_utf16(name),
            name_type: FILE_NAME_POSIX,
            ..Default::default()
        }
        .to_bytes()
    }

    #[test]
    fn test_fname_case_insensitive_order() {
        let up = generate_default_upcase();
        let a = key_for("alpha");
        let b = key_for("BETA");
        assert_eq!(
            cmp_keys(NTFS_COLLATION_TYPE_FILENAME, &up, &a, &b),
            Ordering::Less
        );
        let x = key_for("Name");
        let y = key_for("nAME");
        // 折叠相等，按原字节序分出先后
        assert_ne!(
            cmp_keys(NTFS_COLLATION_TYPE_FILENAME, &up, &x, &y),
            Ordering::Equal
        );
        assert_eq!(
            cmp_keys(NTFS_COLLATION_TYPE_FILENAME, &up, &x, &x),
            Ordering::Equal
        );
    }

    #[test]
    fn test_uint_and_hash() {
        let k1 = 5u32.to_le_bytes();
        let k2 = 9u32.to_le_bytes();
        assert_eq!(
            cmp_keys(NTFS_COLLATION_TYPE_UINT, &[], &k1, &k2),
            Ordering::Less
        );

        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1[..4].copy_from_slice(&7u32.to_le_bytes());
        h1[4..].copy_from_slice(&2u32.to_le_bytes());
        h2[..4].copy_from_slice(&7u32.to_le_bytes());
        h2[4..].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(
            cmp_keys(NTFS_COLLATION_TYPE_SECURITY_HASH, &[], &h1, &h2),
            Ordering::Less
        );
    }
}
