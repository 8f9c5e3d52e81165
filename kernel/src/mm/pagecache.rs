//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 页缓存 (Page Cache)
//!
//! 以 (vnode, 页索引) 为键缓存文件页，为文件读写和内存映射
//! 提供统一的后备页。
//!
//! # 设计
//! - 条目存放在索引式 arena 里，哈希桶（链式）做键查找，
//!   全局 LRU 链决定驱逐顺序，三者同受一把粗粒度自旋锁保护
//! - 缓存页从伙伴系统按 order-0 申请，页描述符标记 PageCache
//!   并记录条目槽位
//! - 未命中时条目先以 LOCKED 状态插入，读 I/O 在锁外进行；
//!   命中 LOCKED 条目的调用者有界自旋等待。LOCKED 同时挡住
//!   标脏与回写，半载入的页绝不会被写回存储
//! - [`PageRef`] 是 RAII 引用计数守卫，被引用的条目不会被驱逐
//! - 回写 (flush) 遇错即停，失败页保持 DIRTY 等待重试；写 I/O
//!   与读 I/O 一样在锁外进行，回写中的条目持引用防驱逐
//!
//! VFS 与虚拟内存管理器通过 [`VnodeIo`] 和 [`AddressSpaceOps`]
//! 两个 trait 接入，本模块不关心具体文件系统或页表格式。

use core::sync::atomic::{AtomicI32, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{LOCKED_WAIT_SPINS, PAGE_CACHE_BUCKETS};

use super::buddy_allocator::{PhysicalAllocator, GFP_HIGHMEM};
use super::page::{PhysAddr, PhysFrame, VirtAddr, PAGE_SIZE};
use super::page_desc::{PageFlag, PageType};
use super::MmError;

/// 文件节点标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VnodeId(pub u64);

bitflags::bitflags! {
    /// 缓存条目状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// 数据有效，可以命中
        const PRESENT = 1 << 0;
        /// 内容比后备存储新，需要回写
        const DIRTY = 1 << 1;
        /// I/O 进行中，其它访问者等待
        const LOCKED = 1 << 2;
    }
}

bitflags::bitflags! {
    /// 页表映射权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
    }
}

/// 后备存储接口，由 VFS 实现
pub trait VnodeIo: Send + Sync {
    /// 把 vnode 的第 index 页读入 buf（整页）
    fn read_page(&self, vnode: VnodeId, index: usize, buf: &mut [u8]) -> Result<(), MmError>;

    /// 把 buf（整页）写回 vnode 的第 index 页
    fn write_page(&self, vnode: VnodeId, index: usize, buf: &[u8]) -> Result<(), MmError>;
}

/// 地址空间接口，由虚拟内存管理器实现
pub trait AddressSpaceOps {
    fn map_page(&mut self, va: VirtAddr, pa: PhysAddr, flags: MapFlags) -> Result<(), MmError>;

    fn unmap_page(&mut self, va: VirtAddr) -> Result<(), MmError>;
}

/// 条目槽位的空值
const SLOT_NIL: usize = usize::MAX;

/// 缓存条目
struct Entry {
    vnode: VnodeId,
    index: usize,
    frame: PhysFrame,
    /// 活跃引用数（PageRef、映射、进行中的回写各占一个）
    refcount: AtomicI32,
    flags: EntryFlags,
    /// 哈希桶内链
    hash_next: usize,
    /// 全局 LRU 链（head 最旧，tail 最新）
    lru_next: usize,
    lru_prev: usize,
    /// 槽位占用标记
    in_use: bool,
}

struct PageCacheInner {
    entries: Vec<Entry>,
    free_slots: Vec<usize>,
    buckets: Vec<usize>,
    lru_head: usize,
    lru_tail: usize,
    nr_entries: usize,
}

/// 页缓存统计
#[derive(Debug, Clone, Copy, Default)]
pub struct PageCacheStats {
    pub entries: usize,
    pub dirty: usize,
    pub pinned: usize,
}

/// 缓存页快照（调试查询用）
#[derive(Debug, Clone, Copy)]
pub struct CachedPageInfo {
    pub vnode: VnodeId,
    pub index: usize,
    pub phys: PhysAddr,
    pub refcount: i32,
    pub flags: EntryFlags,
}

/// 页缓存
pub struct PageCache {
    phys: Arc<PhysicalAllocator>,
    io: Arc<dyn VnodeIo>,
    inner: Mutex<PageCacheInner>,
}

impl PageCache {
    pub fn new(phys: Arc<PhysicalAllocator>, io: Arc<dyn VnodeIo>) -> Self {
        let mut buckets = Vec::with_capacity(PAGE_CACHE_BUCKETS);
        buckets.resize(PAGE_CACHE_BUCKETS, SLOT_NIL);
        Self {
            phys,
            io,
            inner: Mutex::new(PageCacheInner {
                entries: Vec::new(),
                free_slots: Vec::new(),
                buckets,
                lru_head: SLOT_NIL,
                lru_tail: SLOT_NIL,
                nr_entries: 0,
            }),
        }
    }

    /// 获取 vnode 的第 index 页，必要时从后备存储读入
    ///
    /// 返回的 [`PageRef`] 持有一个引用，离开作用域时自动释放。
    /// 命中 LOCKED 条目时有界自旋，超时返回 [`MmError::Busy`]。
    pub fn get(&self, vnode: VnodeId, index: usize) -> Result<PageRef<'_>, MmError> {
        let (frame, slot, newly_loaded) = self.pin(vnode, index)?;
        Ok(PageRef {
            cache: self,
            slot,
            frame,
            vnode,
            index,
            newly_loaded,
        })
    }

    /// 核心查找：返回 (帧, 槽位, 是否新读入)，引用计数加一
    fn pin(&self, vnode: VnodeId, index: usize) -> Result<(PhysFrame, usize, bool), MmError> {
        let mut spins = 0usize;
        loop {
            let mut inner = self.inner.lock();
            if let Some(slot) = Self::lookup(&inner, vnode, index) {
                if inner.entries[slot].flags.contains(EntryFlags::LOCKED) {
                    // 其它调用者正在做 I/O，锁外等待
                    drop(inner);
                    spins += 1;
                    if spins > LOCKED_WAIT_SPINS {
                        return Err(MmError::Busy);
                    }
                    core::hint::spin_loop();
                    continue;
                }
                let entry = &inner.entries[slot];
                entry.refcount.fetch_add(1, Ordering::AcqRel);
                let frame = entry.frame;
                Self::lru_unlink(&mut inner, slot);
                Self::lru_push_tail(&mut inner, slot);
                return Ok((frame, slot, false));
            }

            // 未命中：先占位（LOCKED），锁外读后备存储
            let frame = self.phys.alloc_pages(0, GFP_HIGHMEM)?;
            let slot = Self::insert_entry(&mut inner, vnode, index, frame);
            let desc = self.phys.frame_desc(frame);
            desc.set_page_type(PageType::PageCache);
            desc.set_private(slot);
            desc.set_flag(PageFlag::Locked);
            drop(inner);

            let buf =
                unsafe { core::slice::from_raw_parts_mut(self.phys.page_ptr(frame), PAGE_SIZE) };
            match self.io.read_page(vnode, index, buf) {
                Ok(()) => {
                    let mut inner = self.inner.lock();
                    let entry = &mut inner.entries[slot];
                    entry.flags.remove(EntryFlags::LOCKED);
                    entry.flags.insert(EntryFlags::PRESENT);
                    desc.clear_flag(PageFlag::Locked);
                    desc.set_flag(PageFlag::UpToDate);
                    return Ok((frame, slot, true));
                }
                Err(err) => {
                    log::warn!(
                        "pagecache: read failed, vnode {} index {}: {:?}",
                        vnode.0,
                        index,
                        err
                    );
                    let mut inner = self.inner.lock();
                    inner.entries[slot].refcount.store(0, Ordering::Release);
                    Self::drop_entry(&self.phys, &mut inner, slot);
                    return Err(err);
                }
            }
        }
    }

    fn unpin(&self, slot: usize) {
        let inner = self.inner.lock();
        let entry = &inner.entries[slot];
        let prev = entry.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(entry.in_use && prev > 0);
    }

    /// 标记条目为脏
    ///
    /// 正在载入（LOCKED）的页拒绝标脏，返回 [`MmError::Busy`]：
    /// 数据尚未就位，标脏会让回写把半载入的内容写回存储。
    pub fn mark_dirty(&self, vnode: VnodeId, index: usize) -> Result<(), MmError> {
        let mut inner = self.inner.lock();
        let slot = Self::lookup(&inner, vnode, index).ok_or(MmError::NotPresent)?;
        let entry = &mut inner.entries[slot];
        if entry.flags.contains(EntryFlags::LOCKED) {
            return Err(MmError::Busy);
        }
        entry.flags.insert(EntryFlags::DIRTY);
        let frame = entry.frame;
        self.phys.frame_desc(frame).set_flag(PageFlag::Dirty);
        Ok(())
    }

    /// 回写一个 vnode 的所有脏页，返回回写页数
    ///
    /// 遇到第一个写错误立即停止，失败页恢复 DIRTY 等待重试。
    /// 正在载入（LOCKED）的页被跳过，数据就位前不会触达存储。
    pub fn flush_vnode(&self, vnode: VnodeId) -> Result<usize, MmError> {
        self.flush_filter(Some(vnode))
    }

    /// 回写全部脏页
    pub fn sync_all(&self) -> Result<usize, MmError> {
        self.flush_filter(None)
    }

    fn flush_filter(&self, vnode: Option<VnodeId>) -> Result<usize, MmError> {
        let mut flushed = 0;
        let mut slot = 0;
        loop {
            // 持锁挑选条目：先清脏位并持引用，写 I/O 在锁外进行。
            // I/O 期间的新写入会重新标脏，下一轮 flush 再收
            let job = {
                let mut inner = self.inner.lock();
                if slot >= inner.entries.len() {
                    break;
                }
                let entry = &mut inner.entries[slot];
                if !entry.in_use
                    || !entry.flags.contains(EntryFlags::DIRTY)
                    || entry.flags.contains(EntryFlags::LOCKED)
                    || vnode.map_or(false, |v| entry.vnode != v)
                {
                    None
                } else {
                    entry.refcount.fetch_add(1, Ordering::AcqRel);
                    entry.flags.remove(EntryFlags::DIRTY);
                    let (v, index, frame) = (entry.vnode, entry.index, entry.frame);
                    self.phys.frame_desc(frame).clear_flag(PageFlag::Dirty);
                    Some((v, index, frame))
                }
            };

            if let Some((v, index, frame)) = job {
                let result = self.write_out(v, index, frame);
                let mut inner = self.inner.lock();
                let entry = &mut inner.entries[slot];
                entry.refcount.fetch_sub(1, Ordering::AcqRel);
                if let Err(err) = result {
                    // 失败页恢复 DIRTY
                    entry.flags.insert(EntryFlags::DIRTY);
                    self.phys.frame_desc(frame).set_flag(PageFlag::Dirty);
                    return Err(err);
                }
                flushed += 1;
            }
            slot += 1;
        }
        Ok(flushed)
    }

    /// 锁外回写单页
    fn write_out(&self, vnode: VnodeId, index: usize, frame: PhysFrame) -> Result<(), MmError> {
        let buf = unsafe { core::slice::from_raw_parts(self.phys.page_ptr(frame), PAGE_SIZE) };
        self.io.write_page(vnode, index, buf).map_err(|err| {
            log::warn!(
                "pagecache: writeback failed, vnode {} index {}: {:?}",
                vnode.0,
                index,
                err
            );
            err
        })
    }

    /// 从 LRU 头部驱逐至多 target 个干净、未被引用的条目
    ///
    /// 返回实际驱逐数。脏页和 LOCKED 页被跳过，先 flush 再驱逐。
    pub fn evict_some(&self, target: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        let mut slot = inner.lru_head;
        while slot != SLOT_NIL && evicted < target {
            let next = inner.entries[slot].lru_next;
            let evictable = {
                let entry = &inner.entries[slot];
                entry.refcount.load(Ordering::Acquire) == 0
                    && !entry
                        .flags
                        .intersects(EntryFlags::DIRTY | EntryFlags::LOCKED)
            };
            if evictable {
                Self::drop_entry(&self.phys, &mut inner, slot);
                evicted += 1;
            }
            slot = next;
        }
        if evicted > 0 {
            log::debug!("pagecache: evicted {} pages", evicted);
        }
        evicted
    }

    /// 丢弃一个 vnode 的全部干净、未被引用的条目（文件删除等）
    ///
    /// 返回丢弃数；脏页或被引用的页留在缓存里。
    pub fn invalidate_vnode(&self, vnode: VnodeId) -> usize {
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        for slot in 0..inner.entries.len() {
            let matches = {
                let entry = &inner.entries[slot];
                entry.in_use
                    && entry.vnode == vnode
                    && entry.refcount.load(Ordering::Acquire) == 0
                    && !entry
                        .flags
                        .intersects(EntryFlags::DIRTY | EntryFlags::LOCKED)
            };
            if matches {
                Self::drop_entry(&self.phys, &mut inner, slot);
                dropped += 1;
            }
        }
        dropped
    }

    // ========== 内存映射 ==========

    /// 把文件页映射到地址空间
    ///
    /// 除非 `writable`，映射一律去掉写权限，首次写触发缺页后
    /// 用 [`Self::remap_writable`] 升级，这样脏页跟踪不会漏页。
    /// 映射持有条目的一个引用，直到 [`Self::unmap_from`]。
    pub fn map_into(
        &self,
        aspace: &mut dyn AddressSpaceOps,
        vnode: VnodeId,
        offset: usize,
        va: VirtAddr,
        prot: MapFlags,
        writable: bool,
    ) -> Result<(), MmError> {
        if offset % PAGE_SIZE != 0 || !va.is_aligned() {
            return Err(MmError::InvalidArgument);
        }
        let index = offset / PAGE_SIZE;
        let (frame, slot, _) = self.pin(vnode, index)?;

        let mut flags = prot;
        if !writable {
            flags.remove(MapFlags::WRITE);
        }
        if let Err(err) = aspace.map_page(va, self.phys.frame_phys(frame), flags) {
            self.unpin(slot);
            return Err(err);
        }
        Ok(())
    }

    /// 写缺页处理：升级映射为可写并标记脏页
    pub fn remap_writable(
        &self,
        aspace: &mut dyn AddressSpaceOps,
        vnode: VnodeId,
        offset: usize,
        va: VirtAddr,
        prot: MapFlags,
    ) -> Result<(), MmError> {
        if offset % PAGE_SIZE != 0 {
            return Err(MmError::InvalidArgument);
        }
        let index = offset / PAGE_SIZE;
        let pa = {
            let mut inner = self.inner.lock();
            let slot = Self::lookup(&inner, vnode, index).ok_or(MmError::NotPresent)?;
            let entry = &mut inner.entries[slot];
            if entry.flags.contains(EntryFlags::LOCKED) {
                return Err(MmError::Busy);
            }
            // 先标脏再给写权限，落后于映射的回写不会漏掉此页
            entry.flags.insert(EntryFlags::DIRTY);
            let frame = entry.frame;
            self.phys.frame_desc(frame).set_flag(PageFlag::Dirty);
            self.phys.frame_phys(frame)
        };
        aspace.map_page(va, pa, prot | MapFlags::WRITE)
    }

    /// 解除映射并归还映射持有的引用
    pub fn unmap_from(
        &self,
        aspace: &mut dyn AddressSpaceOps,
        vnode: VnodeId,
        offset: usize,
        va: VirtAddr,
    ) -> Result<(), MmError> {
        if offset % PAGE_SIZE != 0 {
            return Err(MmError::InvalidArgument);
        }
        let index = offset / PAGE_SIZE;
        let slot = {
            let inner = self.inner.lock();
            Self::lookup(&inner, vnode, index).ok_or(MmError::NotPresent)?
        };
        aspace.unmap_page(va)?;
        self.unpin(slot);
        Ok(())
    }

    // ========== 统计与调试查询 ==========

    pub fn stats(&self) -> PageCacheStats {
        let inner = self.inner.lock();
        let mut stats = PageCacheStats {
            entries: inner.nr_entries,
            ..Default::default()
        };
        for entry in inner.entries.iter().filter(|e| e.in_use) {
            if entry.flags.contains(EntryFlags::DIRTY) {
                stats.dirty += 1;
            }
            if entry.refcount.load(Ordering::Relaxed) > 0 {
                stats.pinned += 1;
            }
        }
        stats
    }

    /// 查询单页的缓存状态
    pub fn debug_lookup(&self, vnode: VnodeId, index: usize) -> Option<CachedPageInfo> {
        let inner = self.inner.lock();
        let slot = Self::lookup(&inner, vnode, index)?;
        Some(self.snapshot(&inner.entries[slot]))
    }

    /// 查询一段页索引区间内的缓存条目，可按标志过滤
    ///
    /// `filter` 为空时返回区间内全部条目，否则只返回与之相交的。
    pub fn debug_range(
        &self,
        vnode: VnodeId,
        start_index: usize,
        end_index: usize,
        filter: EntryFlags,
    ) -> Vec<CachedPageInfo> {
        let inner = self.inner.lock();
        let mut out: Vec<CachedPageInfo> = inner
            .entries
            .iter()
            .filter(|e| {
                e.in_use
                    && e.vnode == vnode
                    && e.index >= start_index
                    && e.index < end_index
                    && (filter.is_empty() || e.flags.intersects(filter))
            })
            .map(|e| self.snapshot(e))
            .collect();
        out.sort_by_key(|info| info.index);
        out
    }

    fn snapshot(&self, entry: &Entry) -> CachedPageInfo {
        CachedPageInfo {
            vnode: entry.vnode,
            index: entry.index,
            phys: self.phys.frame_phys(entry.frame),
            refcount: entry.refcount.load(Ordering::Relaxed),
            flags: entry.flags,
        }
    }

    // ========== 内部结构维护（持锁调用） ==========

    fn bucket_of(vnode: VnodeId, index: usize) -> usize {
        let h = vnode
            .0
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((index as u64).wrapping_mul(0x85EB_CA77_C2B2_AE63));
        (h as usize) % PAGE_CACHE_BUCKETS
    }

    fn lookup(inner: &PageCacheInner, vnode: VnodeId, index: usize) -> Option<usize> {
        let mut slot = inner.buckets[Self::bucket_of(vnode, index)];
        while slot != SLOT_NIL {
            let entry = &inner.entries[slot];
            if entry.vnode == vnode && entry.index == index {
                return Some(slot);
            }
            slot = entry.hash_next;
        }
        None
    }

    /// 新条目：LOCKED 状态、refcount 1，挂入哈希桶与 LRU 尾部
    fn insert_entry(
        inner: &mut PageCacheInner,
        vnode: VnodeId,
        index: usize,
        frame: PhysFrame,
    ) -> usize {
        let entry = Entry {
            vnode,
            index,
            frame,
            refcount: AtomicI32::new(1),
            flags: EntryFlags::LOCKED,
            hash_next: SLOT_NIL,
            lru_next: SLOT_NIL,
            lru_prev: SLOT_NIL,
            in_use: true,
        };
        let slot = match inner.free_slots.pop() {
            Some(slot) => {
                inner.entries[slot] = entry;
                slot
            }
            None => {
                inner.entries.push(entry);
                inner.entries.len() - 1
            }
        };

        let bucket = Self::bucket_of(vnode, index);
        inner.entries[slot].hash_next = inner.buckets[bucket];
        inner.buckets[bucket] = slot;

        Self::lru_push_tail(inner, slot);
        inner.nr_entries += 1;
        slot
    }

    /// 摘除条目并释放页帧（调用者保证 refcount 为 0）
    fn drop_entry(phys: &PhysicalAllocator, inner: &mut PageCacheInner, slot: usize) {
        debug_assert!(inner.entries[slot].refcount.load(Ordering::Relaxed) == 0);
        let (vnode, index, frame) = {
            let entry = &inner.entries[slot];
            (entry.vnode, entry.index, entry.frame)
        };

        // 哈希桶摘链
        let bucket = Self::bucket_of(vnode, index);
        let mut cur = inner.buckets[bucket];
        if cur == slot {
            inner.buckets[bucket] = inner.entries[slot].hash_next;
        } else {
            while cur != SLOT_NIL {
                let next = inner.entries[cur].hash_next;
                if next == slot {
                    inner.entries[cur].hash_next = inner.entries[slot].hash_next;
                    break;
                }
                cur = next;
            }
        }

        Self::lru_unlink(inner, slot);
        inner.entries[slot].in_use = false;
        inner.entries[slot].hash_next = SLOT_NIL;
        inner.free_slots.push(slot);
        inner.nr_entries -= 1;

        if let Err(err) = phys.free_pages(frame, 0) {
            log::error!("pagecache: failed to release frame {}: {:?}", frame.number, err);
        }
    }

    fn lru_push_tail(inner: &mut PageCacheInner, slot: usize) {
        inner.entries[slot].lru_next = SLOT_NIL;
        inner.entries[slot].lru_prev = inner.lru_tail;
        if inner.lru_tail != SLOT_NIL {
            inner.entries[inner.lru_tail].lru_next = slot;
        } else {
            inner.lru_head = slot;
        }
        inner.lru_tail = slot;
    }

    fn lru_unlink(inner: &mut PageCacheInner, slot: usize) {
        let prev = inner.entries[slot].lru_prev;
        let next = inner.entries[slot].lru_next;
        if prev != SLOT_NIL {
            inner.entries[prev].lru_next = next;
        } else {
            inner.lru_head = next;
        }
        if next != SLOT_NIL {
            inner.entries[next].lru_prev = prev;
        } else {
            inner.lru_tail = prev;
        }
        inner.entries[slot].lru_prev = SLOT_NIL;
        inner.entries[slot].lru_next = SLOT_NIL;
    }
}

/// 缓存页的 RAII 引用守卫
///
/// 存活期间条目不会被驱逐；离开作用域时自动归还引用。
pub struct PageRef<'a> {
    cache: &'a PageCache,
    slot: usize,
    frame: PhysFrame,
    vnode: VnodeId,
    index: usize,
    newly_loaded: bool,
}

impl PageRef<'_> {
    pub fn vnode(&self) -> VnodeId {
        self.vnode
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 本次 get 是否触发了后备存储读取
    pub fn newly_loaded(&self) -> bool {
        self.newly_loaded
    }

    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.cache.phys.frame_phys(self.frame)
    }

    /// 从页内读取数据，返回实际读取字节数（越界部分截断）
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= PAGE_SIZE {
            return 0;
        }
        let n = buf.len().min(PAGE_SIZE - offset);
        let src = unsafe {
            core::slice::from_raw_parts(self.cache.phys.page_ptr(self.frame).add(offset), n)
        };
        buf[..n].copy_from_slice(src);
        n
    }

    /// 向页内写入数据并标脏，返回实际写入字节数
    pub fn write(&self, offset: usize, data: &[u8]) -> usize {
        if offset >= PAGE_SIZE {
            return 0;
        }
        let n = data.len().min(PAGE_SIZE - offset);
        let dst = unsafe {
            core::slice::from_raw_parts_mut(self.cache.phys.page_ptr(self.frame).add(offset), n)
        };
        dst.copy_from_slice(&data[..n]);
        self.mark_dirty();
        n
    }

    /// 标记本页为脏
    pub fn mark_dirty(&self) {
        let mut inner = self.cache.inner.lock();
        inner.entries[self.slot].flags.insert(EntryFlags::DIRTY);
        self.cache
            .phys
            .frame_desc(self.frame)
            .set_flag(PageFlag::Dirty);
    }

    /// 当前条目状态
    pub fn flags(&self) -> EntryFlags {
        self.cache.inner.lock().entries[self.slot].flags
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::page::PhysMemory;
    use alloc::collections::BTreeMap;
    use alloc::vec;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// 内存后备存储：BTreeMap 模拟磁盘，可注入读写失败，
    /// 也可让 I/O 停在途中以观察并发行为
    struct MemStore {
        pages: Mutex<BTreeMap<(u64, usize), Vec<u8>>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        block_reads: AtomicBool,
        block_writes: AtomicBool,
    }

    impl MemStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(BTreeMap::new()),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                block_reads: AtomicBool::new(false),
                block_writes: AtomicBool::new(false),
            })
        }

        fn seed(&self, vnode: u64, index: usize, byte: u8) {
            self.pages
                .lock()
                .insert((vnode, index), vec![byte; PAGE_SIZE]);
        }

        fn stored(&self, vnode: u64, index: usize) -> Option<Vec<u8>> {
            self.pages.lock().get(&(vnode, index)).cloned()
        }
    }

    impl VnodeIo for MemStore {
        fn read_page(&self, vnode: VnodeId, index: usize, buf: &mut [u8]) -> Result<(), MmError> {
            if self.fail_reads.load(Ordering::Relaxed) {
                return Err(MmError::StorageIo);
            }
            self.reads.fetch_add(1, Ordering::Relaxed);
            while self.block_reads.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            match self.pages.lock().get(&(vnode.0, index)) {
                Some(data) => buf.copy_from_slice(data),
                None => buf.fill(0),
            }
            Ok(())
        }

        fn write_page(&self, vnode: VnodeId, index: usize, buf: &[u8]) -> Result<(), MmError> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            while self.block_writes.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(MmError::StorageIo);
            }
            self.pages.lock().insert((vnode.0, index), buf.to_vec());
            Ok(())
        }
    }

    /// 记录映射调用的假地址空间
    #[derive(Default)]
    struct MockAspace {
        mappings: BTreeMap<usize, (usize, MapFlags)>,
    }

    impl AddressSpaceOps for MockAspace {
        fn map_page(&mut self, va: VirtAddr, pa: PhysAddr, flags: MapFlags) -> Result<(), MmError> {
            self.mappings.insert(va.as_usize(), (pa.as_usize(), flags));
            Ok(())
        }

        fn unmap_page(&mut self, va: VirtAddr) -> Result<(), MmError> {
            self.mappings
                .remove(&va.as_usize())
                .map(|_| ())
                .ok_or(MmError::NotPresent)
        }
    }

    fn mk() -> (Arc<PhysicalAllocator>, Arc<MemStore>, PageCache) {
        let mem = PhysMemory::new_owned(0x10_0000, 8 * 1024 * 1024).expect("arena");
        let phys = Arc::new(PhysicalAllocator::new(mem).expect("init"));
        let store = MemStore::new();
        let cache = PageCache::new(phys.clone(), store.clone());
        (phys, store, cache)
    }

    const V: VnodeId = VnodeId(7);

    #[test]
    fn test_miss_then_hit() {
        let (_phys, store, cache) = mk();
        store.seed(7, 0, 0x5A);

        {
            let page = cache.get(V, 0).expect("miss load");
            assert!(page.newly_loaded());
            let mut buf = [0u8; 16];
            assert_eq!(page.read(0, &mut buf), 16);
            assert_eq!(buf, [0x5A; 16]);
        }
        assert_eq!(store.reads.load(Ordering::Relaxed), 1);

        {
            let page = cache.get(V, 0).expect("hit");
            assert!(!page.newly_loaded());
        }
        // 命中不再触发读取
        assert_eq!(store.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_sparse_page_reads_zero() {
        let (_phys, _store, cache) = mk();
        let page = cache.get(V, 3).expect("hole");
        let mut buf = [0xFFu8; 32];
        page.read(100, &mut buf);
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn test_refcount_tracks_pins() {
        let (_phys, _store, cache) = mk();

        let a = cache.get(V, 0).unwrap();
        let b = cache.get(V, 0).unwrap();
        assert_eq!(cache.debug_lookup(V, 0).unwrap().refcount, 2);

        drop(a);
        assert_eq!(cache.debug_lookup(V, 0).unwrap().refcount, 1);
        drop(b);
        assert_eq!(cache.debug_lookup(V, 0).unwrap().refcount, 0);
    }

    #[test]
    fn test_write_marks_dirty_and_flush_writes_back() {
        let (_phys, store, cache) = mk();

        {
            let page = cache.get(V, 2).unwrap();
            page.write(10, b"hello");
            assert!(page.flags().contains(EntryFlags::DIRTY));
        }
        assert_eq!(cache.stats().dirty, 1);

        assert_eq!(cache.flush_vnode(V).unwrap(), 1);
        let stored = store.stored(7, 2).expect("written back");
        assert_eq!(&stored[10..15], b"hello");
        assert_eq!(cache.stats().dirty, 0);

        // 再次 flush 没有脏页
        assert_eq!(cache.flush_vnode(V).unwrap(), 0);
    }

    #[test]
    fn test_sync_all_covers_all_vnodes() {
        let (_phys, store, cache) = mk();
        cache.get(VnodeId(1), 0).unwrap().write(0, b"a");
        cache.get(VnodeId(2), 0).unwrap().write(0, b"b");
        cache.get(VnodeId(2), 1).unwrap();

        assert_eq!(cache.sync_all().unwrap(), 2);
        assert_eq!(store.writes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_flush_failure_keeps_dirty() {
        let (_phys, store, cache) = mk();
        cache.get(V, 0).unwrap().write(0, b"x");

        store.fail_writes.store(true, Ordering::Relaxed);
        assert_eq!(cache.flush_vnode(V), Err(MmError::StorageIo));
        assert!(cache
            .debug_lookup(V, 0)
            .unwrap()
            .flags
            .contains(EntryFlags::DIRTY));

        store.fail_writes.store(false, Ordering::Relaxed);
        assert_eq!(cache.flush_vnode(V).unwrap(), 1);
    }

    #[test]
    fn test_read_failure_leaves_no_entry() {
        let (phys, store, cache) = mk();
        let before = phys.free_frames();

        store.fail_reads.store(true, Ordering::Relaxed);
        assert_eq!(cache.get(V, 0).err(), Some(MmError::StorageIo));
        assert!(cache.debug_lookup(V, 0).is_none());
        assert_eq!(phys.free_frames(), before);

        store.fail_reads.store(false, Ordering::Relaxed);
        assert!(cache.get(V, 0).is_ok());
    }

    #[test]
    fn test_evict_follows_lru_order() {
        let (_phys, _store, cache) = mk();
        for index in 0..3 {
            cache.get(V, index).unwrap();
        }
        // 触碰 0 号页，使 1 号成为最旧
        cache.get(V, 0).unwrap();

        assert_eq!(cache.evict_some(1), 1);
        assert!(cache.debug_lookup(V, 1).is_none());
        assert!(cache.debug_lookup(V, 0).is_some());
        assert!(cache.debug_lookup(V, 2).is_some());
    }

    #[test]
    fn test_evict_skips_pinned_and_dirty() {
        let (phys, _store, cache) = mk();
        let pinned = cache.get(V, 0).unwrap();
        cache.get(V, 1).unwrap().mark_dirty();
        cache.get(V, 2).unwrap();

        // 只有 2 号页干净且未被引用
        assert_eq!(cache.evict_some(10), 1);
        assert!(cache.debug_lookup(V, 0).is_some());
        assert!(cache.debug_lookup(V, 1).is_some());
        assert!(cache.debug_lookup(V, 2).is_none());

        drop(pinned);
        cache.flush_vnode(V).unwrap();
        let free_before = phys.free_frames();
        assert_eq!(cache.evict_some(10), 2);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(phys.free_frames(), free_before + 2);
    }

    #[test]
    fn test_invalidate_vnode_scoped() {
        let (_phys, _store, cache) = mk();
        cache.get(VnodeId(1), 0).unwrap();
        cache.get(VnodeId(1), 1).unwrap();
        cache.get(VnodeId(2), 0).unwrap();

        assert_eq!(cache.invalidate_vnode(VnodeId(1)), 2);
        assert!(cache.debug_lookup(VnodeId(1), 0).is_none());
        assert!(cache.debug_lookup(VnodeId(2), 0).is_some());
    }

    #[test]
    fn test_map_into_forces_read_only() {
        let (_phys, store, cache) = mk();
        store.seed(7, 0, 1);
        let mut aspace = MockAspace::default();
        let va = VirtAddr::new(0x4000_0000);

        let prot = MapFlags::READ | MapFlags::WRITE | MapFlags::USER;
        cache.map_into(&mut aspace, V, 0, va, prot, false).unwrap();

        // 非 writable 映射即使请求了 WRITE 也被降级为只读
        let (_pa, flags) = aspace.mappings[&va.as_usize()];
        assert!(!flags.contains(MapFlags::WRITE));
        assert!(flags.contains(MapFlags::READ));
        // 映射持有引用，页不可驱逐
        assert_eq!(cache.evict_some(10), 0);

        // 写缺页：升级为可写并标脏
        cache
            .remap_writable(&mut aspace, V, 0, va, MapFlags::READ | MapFlags::USER)
            .unwrap();
        let (_pa, flags) = aspace.mappings[&va.as_usize()];
        assert!(flags.contains(MapFlags::WRITE));
        assert!(cache
            .debug_lookup(V, 0)
            .unwrap()
            .flags
            .contains(EntryFlags::DIRTY));

        cache.unmap_from(&mut aspace, V, 0, va).unwrap();
        assert!(aspace.mappings.is_empty());
        assert_eq!(cache.debug_lookup(V, 0).unwrap().refcount, 0);

        cache.flush_vnode(V).unwrap();
        assert_eq!(cache.evict_some(10), 1);
    }

    #[test]
    fn test_map_rejects_unaligned() {
        let (_phys, _store, cache) = mk();
        let mut aspace = MockAspace::default();
        assert_eq!(
            cache.map_into(
                &mut aspace,
                V,
                123,
                VirtAddr::new(0x4000_0000),
                MapFlags::READ,
                false
            ),
            Err(MmError::InvalidArgument)
        );
    }

    #[test]
    fn test_remap_missing_page_rejected() {
        let (_phys, _store, cache) = mk();
        let mut aspace = MockAspace::default();
        assert_eq!(
            cache.remap_writable(&mut aspace, V, 0, VirtAddr::new(0x4000_0000), MapFlags::READ),
            Err(MmError::NotPresent)
        );
    }

    #[test]
    fn test_debug_range_filter() {
        let (_phys, _store, cache) = mk();
        for index in 0..5 {
            cache.get(V, index).unwrap();
        }
        cache.mark_dirty(V, 1).unwrap();
        cache.mark_dirty(V, 3).unwrap();

        let all = cache.debug_range(V, 0, 5, EntryFlags::empty());
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].index < w[1].index));

        let dirty = cache.debug_range(V, 0, 5, EntryFlags::DIRTY);
        let indices: Vec<usize> = dirty.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![1, 3]);

        let tail = cache.debug_range(V, 3, 5, EntryFlags::empty());
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn test_frame_tagged_as_page_cache() {
        let (phys, _store, cache) = mk();
        let page = cache.get(V, 0).unwrap();
        let desc = phys.frame_desc(page.frame());
        assert_eq!(desc.page_type(), PageType::PageCache);
        assert!(desc.is_uptodate());
        assert!(page.phys_addr().is_aligned());
    }

    #[test]
    fn test_populating_page_rejects_dirty_and_flush() {
        let (_phys, store, cache) = mk();
        store.seed(7, 0, 0x5A);
        store.block_reads.store(true, Ordering::Release);

        std::thread::scope(|s| {
            let loader = s.spawn(|| cache.get(V, 0).map(drop));
            // 等待条目以 LOCKED 状态插入
            while cache.debug_lookup(V, 0).is_none() {
                core::hint::spin_loop();
            }
            assert!(cache
                .debug_lookup(V, 0)
                .unwrap()
                .flags
                .contains(EntryFlags::LOCKED));

            // 载入途中的页：不可标脏，flush 也不触碰它
            assert_eq!(cache.mark_dirty(V, 0), Err(MmError::Busy));
            assert_eq!(cache.flush_vnode(V).unwrap(), 0);
            assert_eq!(store.writes.load(Ordering::Relaxed), 0);

            store.block_reads.store(false, Ordering::Release);
            loader.join().expect("loader thread").expect("load");
        });

        // 存储内容完好，载入的数据正确
        assert_eq!(store.stored(7, 0).unwrap(), vec![0x5A; PAGE_SIZE]);
        let page = cache.get(V, 0).unwrap();
        let mut buf = [0u8; 4];
        page.read(0, &mut buf);
        assert_eq!(buf, [0x5A; 4]);
    }

    #[test]
    fn test_cache_usable_during_writeback() {
        let (_phys, store, cache) = mk();
        cache.get(V, 0).unwrap().write(0, b"dirty");
        store.block_writes.store(true, Ordering::Release);

        std::thread::scope(|s| {
            let flusher = s.spawn(|| cache.flush_vnode(V));
            // 等待回写 I/O 开始
            while store.writes.load(Ordering::Relaxed) == 0 {
                core::hint::spin_loop();
            }

            // 写 I/O 进行期间缓存锁未被占用，其它页照常存取
            let page = cache.get(V, 5).unwrap();
            assert!(page.newly_loaded());
            drop(page);
            // 回写中的条目持有引用，不会被驱逐
            assert_eq!(cache.debug_lookup(V, 0).unwrap().refcount, 1);
            assert_eq!(cache.evict_some(10), 1);

            store.block_writes.store(false, Ordering::Release);
            assert_eq!(flusher.join().expect("flusher thread").unwrap(), 1);
        });

        assert_eq!(&store.stored(7, 0).unwrap()[..5], b"dirty");
        assert!(!cache
            .debug_lookup(V, 0)
            .unwrap()
            .flags
            .contains(EntryFlags::DIRTY));
        assert_eq!(cache.debug_lookup(V, 0).unwrap().refcount, 0);
    }
}
