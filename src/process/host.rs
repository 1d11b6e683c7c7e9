//! 用宿主机线程模拟硬件线程，供单元测试使用。
//!
//! 每个线程是一个执行上下文：线程私有的 CPU 编号、任务编号、中断标志
//! 与嵌套记录。睡眠即释放锁后让出时间片，由调用者循环重新检查。

use std::boxed::Box;
use std::cell::Cell;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use super::{register_hart, Cpu, Hart};
use crate::spinlock::SpinLockGuard;

static NEXT_TASK: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
    static TASK_ID: usize = NEXT_TASK.fetch_add(1, Ordering::Relaxed);
    static INTR: Cell<bool> = const { Cell::new(true) };
    static CPU: &'static Cpu = Box::leak(Box::new(Cpu::new()));
}

pub(crate) struct HostHart;

static HOST: HostHart = HostHart;

impl Hart for HostHart {
    fn cpu_id(&self) -> usize {
        CPU_ID.with(|id| id.get())
    }

    fn task_id(&self) -> usize {
        TASK_ID.with(|id| *id)
    }

    fn cpu(&self) -> &Cpu {
        CPU.with(|c| *c)
    }

    fn intr_get(&self) -> bool {
        INTR.with(|i| i.get())
    }

    fn intr_on(&self) {
        INTR.with(|i| i.set(true));
    }

    fn intr_off(&self) {
        INTR.with(|i| i.set(false));
    }

    fn sleep(&self, _chan: usize, guard: SpinLockGuard<'_, ()>) {
        drop(guard);
        thread::yield_now();
    }

    fn wakeup(&self, _chan: usize) {}
}

/// 注册宿主机模拟（整个测试进程只注册一次），并把当前线程设为 CPU `cpu`。
pub(crate) fn enter(cpu: usize) {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| register_hart(&HOST));
    CPU_ID.with(|id| id.set(cpu));
}
