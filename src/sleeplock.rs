//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会进入休眠状态，避免忙等待。
//! 块缓存用它保护缓冲区内容：持有者可以在持锁期间等待磁盘 I/O。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::process::hart;
use crate::spinlock::SpinLock;

/// 没有持有者时 `owner` 的取值
const NO_OWNER: usize = 0;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的进程会进入休眠状态，
/// 直到锁被释放后被唤醒。持有睡眠锁时中断保持开启。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`与`owner`的一致更新
/// - `locked`: 表示锁是否已被占用
/// - `owner`: 持有者的任务编号，用于持有者检查与重入检测
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: AtomicBool,
    owner: AtomicUsize,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果由当前进程持有：重入，panic
    ///   - 如果已被他人锁定：调用`sleep()`让当前进程休眠，醒来后重新检查
    ///   - 如果未锁定：设置`locked=true`、记录持有者并返回守卫
    /// 3. 释放内部自旋锁（因已设置locked状态）
    ///
    /// # 可能的错误
    /// 同一进程重复获取会 panic（`"sleeplock {name} re-acquire"`）。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let me = hart().task_id();
        let mut guard = self.lock.lock();

        while self.locked.load(Ordering::Relaxed) {
            if self.owner.load(Ordering::Relaxed) == me {
                panic!("sleeplock {} re-acquire", self.name);
            }
            // 让当前进程休眠，等待锁释放
            hart().sleep(self.chan(), guard);
            // 被唤醒后重新获取内部锁
            guard = self.lock.lock();
        }

        self.locked.store(true, Ordering::Relaxed);
        self.owner.store(me, Ordering::Relaxed);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前进程是否持有该锁。
    pub fn holding(&self) -> bool {
        let _guard = self.lock.lock();
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == hart().task_id()
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.store(false, Ordering::Relaxed);
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        hart().wakeup(self.chan());
        drop(guard);
    }

    /// 睡眠与唤醒使用的通道：`locked` 字段的地址
    fn chan(&self) -> usize {
        self.locked.as_ptr() as usize
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 当前进程是否仍是该锁的持有者。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::host;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn holder_is_recorded() {
        host::enter(0);
        let l = SleepLock::new(7u32, "holder");
        assert!(!l.holding());
        let g = l.lock();
        assert!(g.holding());
        assert_eq!(*g, 7);
        drop(g);
        assert!(!l.holding());
    }

    #[test]
    fn interrupts_stay_on_while_held() {
        host::enter(0);
        let l = SleepLock::new((), "intr");
        let _g = l.lock();
        assert!(hart().intr_get());
    }

    #[test]
    #[should_panic(expected = "sleeplock twice re-acquire")]
    fn reacquire_from_same_task() {
        host::enter(0);
        let l = SleepLock::new((), "twice");
        let _g = l.lock();
        let _g2 = l.lock();
    }

    #[test]
    fn blocks_other_task_until_released() {
        let l = SleepLock::new(0u32, "block");
        let entered = AtomicBool::new(false);
        thread::scope(|s| {
            host::enter(0);
            let mut g = l.lock();
            let waiter = s.spawn(|| {
                host::enter(1);
                let mut g = l.lock();
                entered.store(true, Ordering::SeqCst);
                *g += 1;
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!entered.load(Ordering::SeqCst));
            *g += 1;
            drop(g);
            waiter.join().unwrap();
        });
        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(*l.lock(), 2);
    }
}
