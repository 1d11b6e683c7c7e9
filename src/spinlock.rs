//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。
//!
//! 自旋锁只用于保护短小的元数据临界区（空闲链表头、哈希桶链表头、驱逐锁），
//! 持有期间关闭中断，绝不能跨越可能睡眠的操作。

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::{hart, push_off, IntrOff};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的CPU将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的CPU ID，用于检测同一CPU上的重入。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 当前持有锁的CPU ID（-1表示无CPU持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`关闭中断，守卫随锁一起保存；
    /// 2. 检查当前CPU是否已持有锁（防止重入）；
    /// 3. 通过原子操作忙等待直到获取锁；
    /// 4. 设置内存屏障确保操作顺序；
    /// 5. 记录当前CPU ID；
    /// 6. 返回守卫对象。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁并恢复中断
    /// ```
    ///
    /// # 可能的错误
    /// 同一CPU重复获取同一把锁会 panic（`"spinlock {name} acquire"`）。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let intr = self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _intr: intr,
        }
    }

    /// 检查当前CPU是否持有此锁（内部方法）。
    ///
    /// # 前提条件
    /// - 中断必须已关闭（由`push_off`保证），否则CPU编号可能在检查过程中改变。
    fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == hart().cpu_id() as isize
    }

    fn acquire(&self) -> IntrOff {
        let intr = push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(intr.cpu_id() as isize, Ordering::Relaxed);
        intr
    }

    /// 释放锁的核心实现（内部方法），由守卫的`Drop`调用。
    /// 中断状态随后由守卫中的`IntrOff`恢复。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有且当前CPU中断关闭。
/// 守卫离开作用域时先释放锁，再恢复中断状态。
/// 守卫不能跨线程传递，也不应跨越任何可能睡眠的操作。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
    // 字段在 drop() 之后析构：先放锁，后开中断
    _intr: IntrOff,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 检查当前CPU是否持有此锁，守卫存在时应始终为真。
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::host;
    use std::thread;

    #[test]
    fn smoke() {
        host::enter(0);
        let m = SpinLock::new((), "smoke");
        m.lock();
        m.lock();
    }

    #[test]
    fn guard_disables_interrupts() {
        host::enter(0);
        let m = SpinLock::new(0usize, "intr");
        let g = m.lock();
        assert!(!hart().intr_get());
        assert!(g.holding());
        drop(g);
        assert!(hart().intr_get());
    }

    #[test]
    #[should_panic(expected = "spinlock reentry acquire")]
    fn reentry_on_same_cpu() {
        host::enter(0);
        let m = SpinLock::new((), "reentry");
        let _g = m.lock();
        let _g2 = m.lock();
    }

    #[test]
    fn counts_across_cpus() {
        let m = SpinLock::new(0usize, "counter");
        thread::scope(|s| {
            for cpu in 0..4 {
                let m = &m;
                s.spawn(move || {
                    host::enter(cpu);
                    for _ in 0..1000 {
                        *m.lock() += 1;
                    }
                });
            }
        });
        host::enter(0);
        assert_eq!(*m.lock(), 4000);
    }
}
