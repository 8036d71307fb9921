//! 设备锁策略
//!
//! 跨扇区的读-改-写序列需要互斥；单线程环境用 `NoLock`，
//! 多线程环境用 `SpinLock`。锁序见 `fs` 模块文档。

/// 块设备访问锁
pub trait DeviceLock {
    fn acquire(&self);
    fn release(&self);
}

/// 无锁策略（外部已串行化）
#[derive(Default)]
pub struct NoLock;

impl DeviceLock for NoLock {
    #[inline]
    fn acquire(&self) {}
    #[inline]
    fn release(&self) {}
}

/// 自旋锁策略
#[derive(Default)]
pub struct SpinLock {
    inner: spin::Mutex<()>,
}

impl DeviceLock for SpinLock {
    fn acquire(&self) {
        core::mem::forget(self.inner.lock());
    }

    fn release(&self) {
        // acquire 端 forget 了 guard，这里手工解锁
        unsafe { self.inner.force_unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spinlock_acquire_release() {
        let l = SpinLock::default();
        l.acquire();
        assert!(l.inner.is_locked());
        l.release();
        assert!(!l.inner.is_locked());
        // 可重复使用
        l.acquire();
        l.release();
    }
}
