//! 缓存层
//!
//! 块缓存用固定数量的缓冲区保存磁盘块的副本，既减少磁盘读取，
//! 也为多个进程共用的磁盘块提供同步点。
//!
//! 使用方式：
//! * 调用 `bread` 获得某个磁盘块的缓冲区；
//! * 修改数据后调用 `bwrite` 写回磁盘；
//! * 用完后释放缓冲区（`Buf` 离开作用域即 `brelse`），之后不得再访问它；
//! * 同一时刻只有一个进程能使用某个缓冲区，不要持有过久。

use array_macro::array;

use spin::Once;

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};

/// 空链接
const NIL: usize = usize::MAX;

/// 尚未绑定任何磁盘块的缓冲区的设备号，`bread` 不接受该设备号。
pub const NODEV: u32 = u32::MAX;

/// 块缓冲区缓存（Buffer Cache）结构体，用于块设备的读写缓存。
///
/// `Bcache` 把 `NBUF` 个缓冲区分布在 `NBUCKET` 个哈希桶中，按 `blockno % NBUCKET`
/// 查找。每个桶是一条由缓冲区编号串起来的单向链表，由各自的自旋锁保护；
/// 命中路径只触碰目标桶的锁，可在各桶之间完全并行。
///
/// 未命中时需要挑选并搬移一个空闲缓冲区，这一多步骤、跨多把锁的过程
/// 由一把全局驱逐锁串行化，以保证同一个 `(dev, blockno)` 最多绑定一个缓冲区。
///
/// # 锁顺序
/// - 驱逐锁总是先于任何桶锁获取，并在所有桶锁操作完成后才释放；
/// - 除搬移缓冲区时“先放源桶锁、再取目标桶锁”之外，不会同时持有两把桶锁；
/// - 缓冲区内容由睡眠锁保护，获取睡眠锁时不持有任何自旋锁。
pub struct Bcache<D> {
    disk: D,

    /// 串行化“查找并占用一个空闲缓冲区”的过程。
    evict: SpinLock<()>,

    /// 哈希桶。持有某个桶的锁时，桶中缓冲区的链接、身份与引用计数都不会改变。
    buckets: [SpinLock<Bucket>; NBUCKET],

    /// 缓冲区数组，长度为固定值 `NBUF`。
    bufs: [BufInner; NBUF],

    /// 所有缓冲区挂入哈希桶之后才完成。
    init: Once<()>,
}

impl<D: BlockDevice> Bcache<D> {
    pub const fn new(disk: D) -> Self {
        Self {
            disk,
            evict: SpinLock::new((), "bcache_evict"),
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache"); NBUCKET],
            bufs: array![_ => BufInner::new(); NBUF],
            init: Once::new(),
        }
    }

    /// 初始化块缓存。
    ///
    /// # 功能说明
    /// 将第 `i` 个缓冲区挂到第 `i % NBUCKET` 个桶中。
    /// 该函数应仅在系统启动时调用一次。
    ///
    /// # 可能的错误
    /// 重复调用会 panic。
    pub fn binit(&self) {
        let mut fresh = false;
        self.init.call_once(|| {
            fresh = true;
            for (i, buf) in self.bufs.iter().enumerate() {
                let mut bucket = self.buckets[i % NBUCKET].lock();
                buf.next.store(bucket.head, Ordering::Relaxed);
                bucket.head = i;
            }
        });
        if !fresh {
            panic!("binit: init twice");
        }
        log::info!("bcache: {} buffers in {} buckets", NBUF, NBUCKET);

        #[cfg(feature = "verbose_init_info")]
        log::info!("bcache: block size {}, buffer array at {:p}", BSIZE, self.bufs.as_ptr());
    }

    /// 获取指定设备与块号对应的缓冲区，返回时已持有其睡眠锁。
    ///
    /// # 流程解释
    /// 1. 命中路径：只锁目标桶，线性查找；命中则引用计数加一，放开桶锁后获取睡眠锁。
    /// 2. 未命中：放开桶锁，获取驱逐锁。
    ///    - 在驱逐锁下重新检查目标桶：另一个进程可能已经完成了同一个块的未命中路径，
    ///      此时直接使用它，不驱逐任何缓冲区；
    ///    - 按固定顺序扫描所有桶，第一个引用计数为 0 的缓冲区即为牺牲者（没有 LRU）；
    ///      若它在别的桶中，先在源桶锁下摘下、放开源桶锁，再在目标桶锁下挂到目标桶；
    ///    - 重新绑定身份、标记为无效、引用计数置 1，放开目标桶锁与驱逐锁，获取睡眠锁。
    ///
    /// # 可能的错误
    /// 所有缓冲区都在使用中时触发 panic（`"bget: no buffers"`）。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        let target = blockno as usize % NBUCKET;

        let bucket = self.buckets[target].lock();
        if let Some(index) = self.find_cached(&bucket, dev, blockno) {
            drop(bucket);
            return self.handle(index, dev, blockno);
        }
        drop(bucket);

        let evict = self.evict.lock();

        // 再查一次：可能已有其他进程缓存了该块，此时不能再驱逐
        let bucket = self.buckets[target].lock();
        if let Some(index) = self.find_cached(&bucket, dev, blockno) {
            drop(bucket);
            drop(evict);
            return self.handle(index, dev, blockno);
        }
        drop(bucket);

        // 确定需要驱逐一个缓冲区
        for i in 0..NBUCKET {
            let mut bucket = self.buckets[i].lock();
            let mut prev = NIL;
            let mut b = bucket.head;
            while b != NIL {
                let buf = &self.bufs[b];
                let next = buf.next.load(Ordering::Relaxed);
                if buf.refcnt.load(Ordering::Relaxed) == 0 {
                    let bucket = if i != target {
                        // 从源桶摘下
                        if prev == NIL {
                            bucket.head = next;
                        } else {
                            self.bufs[prev].next.store(next, Ordering::Relaxed);
                        }
                        drop(bucket);

                        // 放开源桶锁到取得目标桶锁之间，另一个未命中者可能也在挑选牺牲者，
                        // 驱逐锁保证不会有两个缓冲区被绑定到同一个块
                        let mut dst = self.buckets[target].lock();
                        buf.next.store(dst.head, Ordering::Relaxed);
                        dst.head = b;
                        dst
                    } else {
                        bucket
                    };

                    buf.dev.store(dev, Ordering::Relaxed);
                    buf.blockno.store(blockno, Ordering::Relaxed);
                    buf.valid.store(false, Ordering::Relaxed);
                    buf.refcnt.store(1, Ordering::Relaxed);
                    drop(bucket);
                    drop(evict);
                    return self.handle(b, dev, blockno);
                }
                prev = b;
                b = next;
            }
        }

        panic!("bget: no buffers");
    }

    /// 在已加锁的桶中查找 `(dev, blockno)`，命中则引用计数加一。
    fn find_cached(&self, bucket: &SpinLockGuard<'_, Bucket>, dev: u32, blockno: u32) -> Option<usize> {
        let mut b = bucket.head;
        while b != NIL {
            let buf = &self.bufs[b];
            if buf.dev.load(Ordering::Relaxed) == dev && buf.blockno.load(Ordering::Relaxed) == blockno {
                buf.refcnt.fetch_add(1, Ordering::Relaxed);
                return Some(b);
            }
            b = buf.next.load(Ordering::Relaxed);
        }
        None
    }

    /// 已持有引用的缓冲区：获取睡眠锁（可能睡眠），包装为 `Buf`。
    fn handle(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_, D> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 从缓冲区缓存中读取指定设备与块号对应的数据。
    ///
    /// # 功能说明
    /// 返回 `(dev, blockno)` 的缓冲区，调用者独占其内容直到释放。
    /// 若缓冲区尚未有效（首次访问或刚被重新绑定），先从磁盘读入。
    /// 多个进程并发读取同一个块时，只有第一个拿到睡眠锁的进程执行磁盘读取。
    ///
    /// # 可能的错误
    /// - 使用前未调用 `binit`，或 `dev == NODEV` 时 panic；
    /// - 所有缓冲区都在使用中时 panic（`"bget: no buffers"`）。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_, D> {
        if !self.init.is_completed() {
            panic!("bread: bcache used before binit");
        }
        if dev == NODEV {
            panic!("bread: bad dev {}", dev);
        }
        let mut b = self.bget(dev, blockno);
        let valid = &self.bufs[b.index].valid;
        if !valid.load(Ordering::Relaxed) {
            self.disk.rw(dev, blockno, b.data_mut(), false);
            valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 当前绑定到 `(dev, blockno)` 的缓冲区的引用计数；没有缓存该块时返回 `None`。
    pub fn refcnt_of(&self, dev: u32, blockno: u32) -> Option<usize> {
        let bucket = self.buckets[blockno as usize % NBUCKET].lock();
        let mut b = bucket.head;
        while b != NIL {
            let buf = &self.bufs[b];
            if buf.dev.load(Ordering::Relaxed) == dev && buf.blockno.load(Ordering::Relaxed) == blockno {
                return Some(buf.refcnt.load(Ordering::Relaxed));
            }
            b = buf.next.load(Ordering::Relaxed);
        }
        None
    }

    /// 磁盘设备。
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// 在缓冲区所在桶的锁下将引用计数减一。
    ///
    /// 引用计数大于 0 的缓冲区身份不会改变，因此它一定在 `blockno % NBUCKET` 号桶中。
    fn brelse(&self, index: usize, blockno: u32) {
        let _bucket = self.buckets[blockno as usize % NBUCKET].lock();
        let refcnt = &self.bufs[index].refcnt;
        let rc = refcnt.load(Ordering::Relaxed);
        if rc == 0 {
            panic!("brelse: refcnt underflow");
        }
        refcnt.store(rc - 1, Ordering::Relaxed);
    }
}

/// 缓冲块的句柄，表示一个已分配的磁盘块缓存实体。
///
/// `Buf` 代表一个特定 `(dev, blockno)` 的缓冲区，持有其数据的睡眠锁，
/// 并占用一份引用计数。离开作用域时执行 `brelse`：先释放睡眠锁，再减少引用计数。
pub struct Buf<'a, D: BlockDevice> {
    cache: &'a Bcache<D>,

    /// 缓冲区在 `bufs` 数组中的编号
    index: usize,
    dev: u32,
    blockno: u32,

    /// 缓冲数据的睡眠锁守卫，在 `drop` 中先于引用计数释放。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a, D: BlockDevice> Buf<'a, D> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &BufData {
        self.guard()
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        match self.data.as_mut() {
            Some(guard) => &mut **guard,
            None => panic!("buf: data released"),
        }
    }

    fn guard(&self) -> &SleepLockGuard<'a, BufData> {
        match self.data.as_ref() {
            Some(guard) => guard,
            None => panic!("buf: data released"),
        }
    }

    /// 将缓冲区内容写回磁盘。
    ///
    /// 没有脏位优化：每次调用都执行一次磁盘写，且不改变有效位。
    ///
    /// # 可能的错误
    /// 当前进程不是该缓冲区睡眠锁的持有者时 panic（`"bwrite"`），
    /// 例如句柄被转交给了另一个进程。
    pub fn bwrite(&mut self) {
        if !self.guard().holding() {
            panic!("bwrite");
        }
        let (cache, dev, blockno) = (self.cache, self.dev, self.blockno);
        cache.disk.rw(dev, blockno, self.data_mut(), true);
    }

    /// 显式释放缓冲区，等价于让 `Buf` 离开作用域。
    pub fn brelse(self) {}

    /// 将当前缓冲块的引用计数加一，表示“钉住”该块，防止其被回收。
    ///
    /// 钉住的块在句柄释放后仍然留在缓存中，常用于日志层在事务提交前
    /// 保留已修改的块。需与 `unpin` 配对使用。
    pub fn pin(&self) {
        let _bucket = self.cache.buckets[self.blockno as usize % NBUCKET].lock();
        self.cache.bufs[self.index].refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// 将当前缓冲块的引用计数减一，解除 `pin` 的效果。
    ///
    /// # 可能的错误
    /// 引用计数不能减到句柄自身持有的那一份以下，否则 panic（`"bunpin: not match"`）。
    pub fn unpin(&self) {
        let _bucket = self.cache.buckets[self.blockno as usize % NBUCKET].lock();
        let refcnt = &self.cache.bufs[self.index].refcnt;
        let rc = refcnt.load(Ordering::Relaxed);
        if rc <= 1 {
            panic!("bunpin: not match");
        }
        refcnt.store(rc - 1, Ordering::Relaxed);
    }
}

impl<'a, D: BlockDevice> Drop for Buf<'a, D> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if !data.holding() {
                panic!("brelse");
            }
            drop(data);
        }
        self.cache.brelse(self.index, self.blockno);
    }
}

/// 哈希桶：缓冲区链表的表头
struct Bucket {
    head: usize,
}

impl Bucket {
    const fn new() -> Self {
        Self { head: NIL }
    }
}

/// 单个缓冲区。
///
/// 除 `data` 与 `valid` 之外的字段只在持有该缓冲区当前所在桶的锁时修改；
/// 使用原子类型只是为了在锁的保护下以 `Relaxed` 访问。
struct BufInner {
    dev: AtomicU32,
    blockno: AtomicU32,

    /// 同一个桶中下一个缓冲区的编号
    next: AtomicUsize,

    /// 当前持有该缓冲区的句柄数加上被钉住的次数。
    /// 为 0 时可以被驱逐，大于 0 时身份不会改变。
    refcnt: AtomicUsize,

    /// 数据是否反映磁盘内容。
    ///
    /// 在驱逐时（引用计数为 0，没有人持有睡眠锁）置为 false，
    /// 其余时候只在持有睡眠锁时访问。
    valid: AtomicBool,

    /// 缓冲块的实际数据，受睡眠锁保护。
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            dev: AtomicU32::new(NODEV),
            blockno: AtomicU32::new(NODEV),
            next: AtomicUsize::new(NIL),
            refcnt: AtomicUsize::new(0),
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &[u8; BSIZE] {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.0
    }
}
