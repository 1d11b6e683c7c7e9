//! 物理页分配器，每个 CPU 一条空闲链表
//!
//! 为用户进程、内核栈、页表页和管道缓冲区分配整页（4096 字节）物理内存。
//! 本 CPU 的链表为空时，从其他 CPU 的链表中“偷”走一半。

use bit_field::BitField;

use array_macro::array;

use core::mem::size_of;
use core::ptr;
use core::slice;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use crate::consts::{ALLOC_JUNK, FREE_JUNK, NCPU, PGSIZE};
use crate::process::push_off;
use crate::spinlock::SpinLock;

/// 元数据字中链接字段所占的位
const LINK_BITS: usize = usize::BITS as usize - 1;
/// 元数据字的最高位：页帧已分配
const ALLOCATED_BIT: usize = usize::BITS as usize - 1;
/// 空链接
const NIL: usize = (1 << LINK_BITS) - 1;

/// 物理页分配器。
///
/// `Kmem` 管理 `kinit` 给定区间内的全部页帧，并为每个 CPU 维护一条
/// 由自旋锁保护的空闲链表。链表按页帧编号相连，链接保存在区间开头
/// 划出的元数据表中，而不是写进空闲页帧本身。
///
/// # 并发约束
/// - 每把 CPU 链表锁只在 O(1) 的压入/弹出或一次折半拆分期间持有；
/// - 任何时刻不会同时持有两把 CPU 链表锁；
/// - 填充垃圾字节发生在锁外。
pub struct Kmem {
    lists: [SpinLock<FreeList>; NCPU],
    arena: Once<Arena>,
}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            lists: array![_ => SpinLock::new(FreeList::new(), "kmem"); NCPU],
            arena: Once::new(),
        }
    }

    /// 初始化物理页分配器。
    ///
    /// # 功能说明
    /// 将区间 `[start, end)` 交给分配器管理：起点按页向上对齐、终点按页向下对齐，
    /// 开头若干页用作元数据表（每个页帧一个机器字），其余页帧按地址顺序
    /// 轮流释放到 `ncpu` 条 CPU 链表上。
    ///
    /// # 参数
    /// - `start`: 可用物理内存起点，通常是内核镜像末尾 `end`；
    /// - `end`: 可用物理内存终点，通常是 `PHYSTOP`；
    /// - `ncpu`: 参与分配的 CPU 个数，`1..=NCPU`。
    ///
    /// # 可能的错误
    /// - 重复初始化会 panic；
    /// - `ncpu` 越界，或区间放不下元数据和至少一个页帧时 panic。
    ///
    /// # 安全性
    /// - 调用者保证 `[start, end)` 是有效、可写且不被其他任何代码使用的内存；
    /// - 必须在其他 CPU 使用分配器之前调用。
    pub unsafe fn kinit(&self, start: usize, end: usize, ncpu: usize) {
        if ncpu == 0 || ncpu > NCPU {
            panic!("kinit: bad ncpu {}", ncpu);
        }
        let start = round_up(start, PGSIZE);
        let end = round_down(end, PGSIZE);
        if end <= start {
            panic!("kinit: empty range");
        }

        let npages = (end - start) / PGSIZE;
        let meta_pages = round_up(npages * size_of::<AtomicUsize>(), PGSIZE) / PGSIZE;
        if meta_pages >= npages {
            panic!("kinit: range too small");
        }
        let nframes = npages - meta_pages;

        // 元数据表位于 [start, base)，初始时所有页帧都视为已分配。
        // 只在首次初始化时写入，重复调用不能触碰正在使用的表
        let mut fresh = false;
        let arena = self.arena.call_once(|| {
            fresh = true;
            let meta_ptr = start as *mut AtomicUsize;
            for i in 0..nframes {
                ptr::write(meta_ptr.add(i), AtomicUsize::new(FrameWord::allocated().0));
            }
            Arena {
                base: start + meta_pages * PGSIZE,
                nframes,
                ncpu,
                meta: slice::from_raw_parts(meta_ptr, nframes),
            }
        });
        if !fresh {
            panic!("kinit: init twice");
        }

        log::info!(
            "kmem: {} frames in [{:#x}, {:#x}) over {} cpus",
            nframes,
            arena.base,
            arena.end(),
            ncpu
        );
        #[cfg(feature = "verbose_init_info")]
        log::info!("kmem: {} metadata page(s) at {:#x}", meta_pages, start);

        for i in 0..nframes {
            self.release(arena, i % ncpu, i);
        }
    }

    /// 释放一个物理页帧。
    ///
    /// # 功能说明
    /// 将 `pa` 指向的页帧归还给分配器。`pa` 通常由之前的 `kalloc()` 返回。
    /// 页帧内容被填充为 `FREE_JUNK`，以便捕获悬垂引用，
    /// 然后压入**当前 CPU** 的空闲链表，而不一定是它原来所在的链表。
    ///
    /// # 可能的错误
    /// 以下情况属于内核内部一致性错误，直接 panic：
    /// - `pa` 没有按页对齐，或不在受管理的页帧范围内；
    /// - `pa` 当前并未被分配（重复释放）。
    pub fn kfree(&self, pa: usize) {
        let arena = self.arena();
        let intr = push_off();
        let cpu = arena.check_cpu(intr.cpu_id());

        if pa % PGSIZE != 0 || pa < arena.base || pa >= arena.end() {
            panic!("kfree: bad pa {:#x}", pa);
        }
        let idx = (pa - arena.base) / PGSIZE;
        self.release(arena, cpu, idx);

        drop(intr);
    }

    /// 分配一个 4096 字节的物理页帧。
    ///
    /// # 流程解释
    /// 1. 关闭中断，固定当前 CPU；
    /// 2. 从本 CPU 链表弹出一页；
    /// 3. 若本 CPU 链表为空，依次检查其他 CPU 的链表，从第一条非空链表偷走后一半，
    ///    先在对方锁下摘下，放开对方的锁，再在本 CPU 锁下接到本 CPU 链表上；
    /// 4. 再次弹出；
    /// 5. 在锁外将页帧填充为 `ALLOC_JUNK`。
    ///
    /// # 返回值
    /// - `Some(pa)`：页帧的物理地址；
    /// - `None`：所有 CPU 上都没有空闲页帧。
    pub fn kalloc(&self) -> Option<usize> {
        let arena = self.arena();
        let intr = push_off();
        let cpu = arena.check_cpu(intr.cpu_id());

        let mut idx = self.lists[cpu].lock().pop(arena);
        if idx.is_none() {
            if let Some(stolen) = self.steal(arena, cpu) {
                let mut list = self.lists[cpu].lock();
                list.splice(arena, stolen);
                idx = list.pop(arena);
            }
        }

        let pa = arena.addr(idx?);
        unsafe {
            ptr::write_bytes(pa as *mut u8, ALLOC_JUNK, PGSIZE);
        }
        drop(intr);
        Some(pa)
    }

    /// 当前所有 CPU 链表上的空闲页帧总数。
    ///
    /// 逐条加锁统计，并发分配/释放时只是一个近似值。
    pub fn free_pages(&self) -> usize {
        let ncpu = self.arena().ncpu;
        (0..ncpu).map(|cpu| self.free_pages_of(cpu)).sum()
    }

    /// CPU `cpu` 链表上的空闲页帧数。
    pub fn free_pages_of(&self, cpu: usize) -> usize {
        self.lists[self.arena().check_cpu(cpu)].lock().len
    }

    /// 受管理的页帧总数。
    pub fn nframes(&self) -> usize {
        self.arena().nframes
    }

    /// 受管理页帧所在的物理地址区间 `[base, end)`。
    pub fn frame_range(&self) -> (usize, usize) {
        let arena = self.arena();
        (arena.base, arena.end())
    }

    fn arena(&self) -> &Arena {
        match self.arena.get() {
            Some(arena) => arena,
            None => panic!("kmem: used before kinit"),
        }
    }

    /// 将编号为 `idx` 的页帧标记为空闲、填充垃圾字节并压入 `cpu` 的链表。
    fn release(&self, arena: &Arena, cpu: usize, idx: usize) {
        let word = &arena.meta[idx];
        if word
            .compare_exchange(
                FrameWord::allocated().0,
                FrameWord::free(NIL).0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            panic!("kfree: double free {:#x}", arena.addr(idx));
        }

        // 填充垃圾字节以捕获悬垂引用
        unsafe {
            ptr::write_bytes(arena.addr(idx) as *mut u8, FREE_JUNK, PGSIZE);
        }

        self.lists[cpu].lock().push(arena, idx);
    }

    /// 依次检查其他 CPU 的链表，从第一条非空链表摘下后一半。
    ///
    /// 摘下的子链表在放开对方的锁之后才交给调用者，
    /// 因此任何时刻只持有一把 CPU 链表锁。
    fn steal(&self, arena: &Arena, cpu: usize) -> Option<Sublist> {
        for victim in (0..arena.ncpu).filter(|&i| i != cpu) {
            let stolen = self.lists[victim].lock().split_off_half(arena);
            if let Some(sub) = stolen {
                log::trace!("kalloc: cpu {} stole {} pages from cpu {}", cpu, sub.len, victim);
                return Some(sub);
            }
        }
        None
    }
}

/// 受管理的页帧区间与元数据表，`kinit` 之后不再改变。
struct Arena {
    /// 第一个页帧的物理地址
    base: usize,
    nframes: usize,
    ncpu: usize,
    /// 每个页帧一个元数据字，见 [`FrameWord`]
    meta: &'static [AtomicUsize],
}

impl Arena {
    #[inline]
    fn end(&self) -> usize {
        self.base + self.nframes * PGSIZE
    }

    #[inline]
    fn addr(&self, idx: usize) -> usize {
        self.base + idx * PGSIZE
    }

    fn check_cpu(&self, cpu: usize) -> usize {
        if cpu >= self.ncpu {
            panic!("kmem: cpu {} out of range", cpu);
        }
        cpu
    }

    /// 读取空闲页帧的后继。只能在持有该页帧所在链表的锁（或独占摘下的子链表）时调用。
    #[inline]
    fn next(&self, idx: usize) -> usize {
        FrameWord(self.meta[idx].load(Ordering::Relaxed)).next()
    }

    #[inline]
    fn set_next(&self, idx: usize, next: usize) {
        self.meta[idx].store(FrameWord::free(next).0, Ordering::Relaxed);
    }

    #[inline]
    fn mark_allocated(&self, idx: usize) {
        self.meta[idx].store(FrameWord::allocated().0, Ordering::Release);
    }
}

/// 页帧元数据字：最高位表示已分配，其余位是同一链表中下一个空闲页帧的编号。
#[derive(Clone, Copy)]
struct FrameWord(usize);

impl FrameWord {
    fn allocated() -> Self {
        let mut w = 0usize;
        w.set_bit(ALLOCATED_BIT, true);
        w.set_bits(0..LINK_BITS, NIL);
        Self(w)
    }

    fn free(next: usize) -> Self {
        let mut w = 0usize;
        w.set_bits(0..LINK_BITS, next);
        Self(w)
    }

    fn next(self) -> usize {
        if self.0.get_bit(ALLOCATED_BIT) {
            panic!("kmem: allocated frame on free list");
        }
        self.0.get_bits(0..LINK_BITS)
    }
}

/// 一个 CPU 的空闲链表。
struct FreeList {
    head: usize,
    tail: usize,
    len: usize,
}

/// 从某条链表上摘下、尚未接入任何链表的一段空闲页帧。
struct Sublist {
    head: usize,
    tail: usize,
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self { head: NIL, tail: NIL, len: 0 }
    }

    fn push(&mut self, arena: &Arena, idx: usize) {
        arena.set_next(idx, self.head);
        if self.head == NIL {
            self.tail = idx;
        }
        self.head = idx;
        self.len += 1;
    }

    fn pop(&mut self, arena: &Arena) -> Option<usize> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.head = arena.next(idx);
        if self.head == NIL {
            self.tail = NIL;
        }
        self.len -= 1;
        arena.mark_allocated(idx);
        Some(idx)
    }

    /// 用快慢指针找到链表中点，摘下中点之后的部分；只有一个节点时整条摘下。
    fn split_off_half(&mut self, arena: &Arena) -> Option<Sublist> {
        if self.head == NIL {
            return None;
        }
        if self.len == 1 {
            let sub = Sublist { head: self.head, tail: self.tail, len: 1 };
            *self = Self::new();
            return Some(sub);
        }

        let mut slow = self.head;
        let mut fast = arena.next(self.head);
        let mut keep = 1;
        while fast != NIL && arena.next(fast) != NIL {
            slow = arena.next(slow);
            fast = arena.next(arena.next(fast));
            keep += 1;
        }

        let sub = Sublist {
            head: arena.next(slow),
            tail: self.tail,
            len: self.len - keep,
        };
        arena.set_next(slow, NIL);
        self.tail = slow;
        self.len = keep;
        Some(sub)
    }

    fn splice(&mut self, arena: &Arena, sub: Sublist) {
        arena.set_next(sub.tail, self.head);
        if self.head == NIL {
            self.tail = sub.tail;
        }
        self.head = sub.head;
        self.len += sub.len;
    }
}

#[inline]
fn round_up(n: usize, size: usize) -> usize {
    (n + size - 1) / size * size
}

#[inline]
fn round_down(n: usize, size: usize) -> usize {
    (n / size) * size
}
