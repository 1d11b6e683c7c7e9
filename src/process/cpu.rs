//! 处理器状态管理，用于控制中断开关的嵌套

use core::cell::Cell;
use core::marker::PhantomData;

use super::hart;

/// 每个执行上下文的中断嵌套记录。
///
/// 由 [`Hart::cpu`](super::Hart::cpu) 提供：内核中是当前 CPU 的表项，
/// 宿主机模拟中是当前线程私有的一份。只由所属的执行上下文本地访问。
pub struct Cpu {
    /// 关闭中断的嵌套计数，表示当前中断被禁止的层数。
    /// 每调用一次 `push_off` 计数加 1，每调用一次 `pop_off` 计数减 1。
    noff: Cell<u8>,

    /// 中断使能标志，记录关闭中断之前的中断使能状态，
    /// 用于恢复中断使能。
    intena: Cell<bool>,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            noff: Cell::new(0),
            intena: Cell::new(false),
        }
    }

    /// 当前的中断关闭嵌套层数。
    pub fn depth(&self) -> u8 {
        self.noff.get()
    }
}

/// 中断关闭的作用域守卫，由 [`push_off`] 返回。
///
/// 守卫存活期间当前执行上下文的中断保持关闭，因此 CPU 编号不会改变，
/// 可以通过 [`IntrOff::cpu_id`] 安全地读取。守卫离开作用域时调用 `pop_off`，
/// 包括提前返回与 panic 展开的路径。
///
/// 守卫不能跨线程传递。
pub struct IntrOff {
    _not_send: PhantomData<*const ()>,
}

impl IntrOff {
    /// 当前 CPU 的编号，在守卫存活期间保持稳定。
    #[inline]
    pub fn cpu_id(&self) -> usize {
        hart().cpu_id()
    }
}

impl Drop for IntrOff {
    fn drop(&mut self) {
        pop_off();
    }
}

/// # 功能说明
/// 关闭当前 CPU 的中断，并记录中断关闭的嵌套次数。
/// 与 `intr_off()` 类似，但支持嵌套，
/// 多个 `push_off()` 返回的守卫全部释放后才恢复中断状态。
/// 如果中断原本就是关闭状态，守卫释放后保持关闭。
///
/// # 流程解释
/// 1. 读取当前中断使能状态 `old`。
/// 2. 关闭中断。
/// 3. 若嵌套计数 `noff` 为 0，将原始中断状态保存到 `intena`，用于后续恢复。
/// 4. 将嵌套计数 `noff` 自增 1，表示又关闭了一层中断。
///
/// # 返回值
/// 作用域守卫 [`IntrOff`]，离开作用域时自动恢复。
pub fn push_off() -> IntrOff {
    let h = hart();
    let old = h.intr_get();
    h.intr_off();
    let c = h.cpu();
    if c.noff.get() == 0 {
        c.intena.set(old);
    }
    let noff = match c.noff.get().checked_add(1) {
        Some(noff) => noff,
        None => panic!("push_off(): nested too deep"),
    };
    c.noff.set(noff);
    IntrOff { _not_send: PhantomData }
}

/// # 功能说明
/// 解除之前通过 `push_off()` 关闭的中断，
/// 只有所有嵌套的关闭操作都对应解除后，才真正重新开启中断。
///
/// # 流程解释
/// 1. 检查当前中断是否已开启，若是则 panic，表示中断被意外打开。
/// 2. 检查嵌套计数 `noff` 是否大于 0，否则 panic，表示调用不匹配。
/// 3. 将嵌套计数 `noff` 减 1。
/// 4. 若嵌套计数归零且之前中断为开启状态，恢复中断。
pub(crate) fn pop_off() {
    let h = hart();
    if h.intr_get() {
        panic!("pop_off(): interruptable");
    }
    let c = h.cpu();
    let noff = match c.noff.get().checked_sub(1) {
        Some(noff) => noff,
        None => panic!("pop_off(): count not match"),
    };
    c.noff.set(noff);
    if noff == 0 && c.intena.get() {
        h.intr_on();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::host;

    #[test]
    fn nested_push_off_restores_at_outermost() {
        host::enter(0);
        let h = hart();
        assert!(h.intr_get());

        let outer = push_off();
        assert!(!h.intr_get());
        let inner = push_off();
        assert_eq!(h.cpu().depth(), 2);

        drop(inner);
        assert!(!h.intr_get());
        assert_eq!(h.cpu().depth(), 1);

        drop(outer);
        assert!(h.intr_get());
        assert_eq!(h.cpu().depth(), 0);
    }

    #[test]
    fn push_off_keeps_interrupts_off_if_already_off() {
        host::enter(0);
        let h = hart();
        h.intr_off();
        drop(push_off());
        assert!(!h.intr_get());
        h.intr_on();
    }

    #[test]
    fn cpu_id_is_stable_under_guard() {
        host::enter(3);
        let intr = push_off();
        assert_eq!(intr.cpu_id(), 3);
    }

    #[test]
    #[should_panic(expected = "pop_off(): count not match")]
    fn unmatched_pop_off() {
        host::enter(0);
        let h = hart();
        h.intr_off();
        pop_off();
    }
}
