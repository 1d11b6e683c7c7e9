//! 处理器与调度器的接入层
//!
//! 页分配器与块缓存不实现调度，而是通过 [`Hart`] 使用下层提供的
//! CPU 编号、中断开关以及睡眠/唤醒。内核在启动早期调用一次
//! [`register_hart`] 完成接入。

use spin::Once;

use crate::spinlock::SpinLockGuard;

pub use cpu::{push_off, Cpu, IntrOff};

mod cpu;
#[cfg(test)]
pub(crate) mod host;

/// 下层为当前执行上下文提供的处理器服务。
///
/// 所有方法都针对“调用者所在的执行上下文”：`cpu_id` 是当前 CPU，
/// `task_id` 是当前正在运行的进程（或线程），`cpu` 是当前 CPU 的中断嵌套记录。
///
/// # 安全性
/// - `cpu_id` 与 `cpu` 只有在中断关闭时才保证稳定，本 crate 只在
///   [`push_off`] 守卫存活期间使用它们；
/// - `sleep` 必须在让出处理器之前释放 `guard`，并且允许虚假唤醒，
///   调用者总是在循环中重新检查条件。
pub trait Hart: Sync {
    /// 当前 CPU 的编号。
    fn cpu_id(&self) -> usize;

    /// 当前执行上下文（进程）的唯一标识，用于睡眠锁的持有者检查。
    fn task_id(&self) -> usize;

    /// 当前 CPU 的中断嵌套记录。
    fn cpu(&self) -> &Cpu;

    fn intr_get(&self) -> bool;
    fn intr_on(&self);
    fn intr_off(&self);

    /// 原子地释放 `guard` 并让当前进程在 `chan` 上睡眠，被唤醒后返回。
    fn sleep(&self, chan: usize, guard: SpinLockGuard<'_, ()>);

    /// 唤醒所有在 `chan` 上睡眠的进程。
    fn wakeup(&self, chan: usize);
}

static HART: Once<&'static dyn Hart> = Once::new();

/// 注册下层的处理器服务。
///
/// 必须在使用任何锁之前调用且只能调用一次，重复注册会 panic。
pub fn register_hart(h: &'static dyn Hart) {
    let mut fresh = false;
    HART.call_once(|| {
        fresh = true;
        h
    });
    if !fresh {
        panic!("register_hart: registered twice");
    }
}

#[inline]
pub(crate) fn hart() -> &'static dyn Hart {
    match HART.get() {
        Some(h) => *h,
        None => panic!("hart: not registered"),
    }
}
