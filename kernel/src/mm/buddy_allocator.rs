//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Buddy System (伙伴系统) 物理页分配器
//!
//! 算法原理：
//! - 内存按 2^order * PAGE_SIZE 划分为块，order 取值 0..MAX_ORDER
//! - 块的伙伴由帧号异或块大小得到：buddy = idx ^ (1 << order)
//! - 分配时逐级分割大块，释放时与伙伴逐级合并，减少碎片
//!
//! 物理内存按地址划分为 DMA / Normal / High 三个 zone，各自
//! 维护独立的空闲链表和水位。分配先扫描尊重水位的 zone，
//! 失败后忽略水位重扫，最后触发回收挂钩。
//!
//! 每个帧的元数据记录在描述符数组（[`super::page_desc::Page`]）中，
//! 数组本身占据被管理内存开头的若干保留页。空闲链表直接用
//! 描述符的链域串联，无需额外内存。

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{MAX_ORDER, ZONE_DMA_LIMIT, ZONE_HIGHMEM_START};

use super::page::{PhysAddr, PhysFrame, PhysFrameNr, PhysMemory, PAGE_SIZE};
use super::page_desc::{Page, PageType, FRAME_NIL};
use super::MmError;

bitflags::bitflags! {
    /// 分配行为标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// 优先从 DMA 区分配
        const DMA = 1 << 0;
        /// 优先从高端内存区分配
        const HIGHMEM = 1 << 1;
        /// 分配后将整块清零
        const ZERO = 1 << 2;
    }
}

/// 常规内核分配（优先 Normal 区）
pub const GFP_KERNEL: AllocFlags = AllocFlags::empty();
/// DMA 分配
pub const GFP_DMA: AllocFlags = AllocFlags::DMA;
/// 用户页 / 页缓存分配（优先 High 区）
pub const GFP_HIGHMEM: AllocFlags = AllocFlags::HIGHMEM;

/// Zone 种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ZoneKind {
    /// 低 16MB，遗留 DMA 设备可达
    Dma = 0,
    /// 内核直接映射的常规内存
    Normal = 1,
    /// 高端内存（896MB 以上）
    High = 2,
}

const ZONE_COUNT: usize = 3;

/// 单个 zone：一段连续帧区间及其空闲链表
struct Zone {
    kind: ZoneKind,
    /// 区间起始帧（含）
    start: PhysFrameNr,
    /// 区间结束帧（不含）
    end: PhysFrameNr,
    /// 每个 order 的空闲链表头（FRAME_NIL 表示空）
    free_area: Mutex<[PhysFrameNr; MAX_ORDER]>,
    /// 当前空闲帧数
    free_pages: AtomicUsize,
    /// 最低水位：常规分配会为紧急路径留出这么多帧
    watermark_min: usize,
}

impl Zone {
    fn new(kind: ZoneKind, start: PhysFrameNr, end: PhysFrameNr) -> Self {
        let spanned = end.saturating_sub(start);
        Self {
            kind,
            start,
            end,
            free_area: Mutex::new([FRAME_NIL; MAX_ORDER]),
            free_pages: AtomicUsize::new(0),
            // 区间的 1/128，至少 1 帧
            watermark_min: if spanned == 0 { 0 } else { (spanned / 128).max(1) },
        }
    }

    fn spanned(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    fn contains(&self, frame: PhysFrameNr) -> bool {
        frame >= self.start && frame < self.end
    }

    fn free(&self) -> usize {
        self.free_pages.load(Ordering::Relaxed)
    }
}

/// Zone 统计
#[derive(Debug, Clone, Copy)]
pub struct ZoneStats {
    pub kind: ZoneKind,
    pub spanned: usize,
    pub free: usize,
    pub watermark_min: usize,
    /// 每个 order 的空闲块数
    pub free_blocks: [usize; MAX_ORDER],
}

/// 分配器全局统计
#[derive(Debug, Clone)]
pub struct BuddyStats {
    pub total_frames: usize,
    pub reserved_frames: usize,
    pub free_frames: usize,
    pub zones: [ZoneStats; ZONE_COUNT],
}

/// 伙伴系统物理页分配器
pub struct PhysicalAllocator {
    mem: PhysMemory,
    /// 描述符数组（位于管理范围起始处）
    frames: *const Page,
    /// 总帧数
    nframes: usize,
    /// 描述符数组占用的保留帧数
    reserved: usize,
    zones: [Zone; ZONE_COUNT],
}

unsafe impl Send for PhysicalAllocator {}
unsafe impl Sync for PhysicalAllocator {}

impl PhysicalAllocator {
    /// 在一段物理内存上建立分配器
    ///
    /// 描述符数组写入范围开头并标记为保留，其余帧以 order-0
    /// 进入空闲链表，再逐级向上合并成尽可能大的块。
    pub fn new(mem: PhysMemory) -> Result<Self, MmError> {
        let nframes = mem.total_frames();
        if nframes == 0 {
            return Err(MmError::InvalidArgument);
        }

        let desc_bytes = nframes * core::mem::size_of::<Page>();
        let reserved = (desc_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        if reserved >= nframes {
            return Err(MmError::InvalidArgument);
        }

        // 描述符数组放在范围开头
        let frames = mem.frame_ptr(0) as *mut Page;
        for i in 0..nframes {
            unsafe { ptr::write(frames.add(i), Page::new()) };
        }

        // 按物理地址划分 zone（帧地址单调递增，区间连续）
        let phys_base = mem.phys_base().as_usize();
        let bound = |limit: usize| -> PhysFrameNr {
            if phys_base >= limit {
                0
            } else {
                ((limit - phys_base) / PAGE_SIZE).min(nframes)
            }
        };
        let dma_end = bound(ZONE_DMA_LIMIT);
        let normal_end = bound(ZONE_HIGHMEM_START).max(dma_end);

        let allocator = Self {
            mem,
            frames,
            nframes,
            reserved,
            zones: [
                Zone::new(ZoneKind::Dma, 0, dma_end),
                Zone::new(ZoneKind::Normal, dma_end, normal_end),
                Zone::new(ZoneKind::High, normal_end, nframes),
            ],
        };

        allocator.seed_free_lists();

        log::info!(
            "buddy: {} frames at {:#x}, {} reserved, zones dma={} normal={} high={}",
            nframes,
            phys_base,
            reserved,
            allocator.zones[0].spanned(),
            allocator.zones[1].spanned(),
            allocator.zones[2].spanned(),
        );

        Ok(allocator)
    }

    /// 初始化空闲链表：order-0 播种后逐级合并
    fn seed_free_lists(&self) {
        for idx in 0..self.reserved {
            self.frame(idx).init_reserved(self.zone_of(idx) as u32);
        }
        for idx in self.reserved..self.nframes {
            self.frame(idx).init_free(self.zone_of(idx) as u32);
        }

        for zone in &self.zones {
            if zone.spanned() == 0 {
                continue;
            }
            let mut heads = zone.free_area.lock();
            let start = zone.start.max(self.reserved);

            for idx in start..zone.end {
                self.list_push(&mut heads, idx, 0);
            }
            zone.free_pages
                .store(zone.end.saturating_sub(start), Ordering::Relaxed);

            // 自底向上合并：块头帧必须按 2^(o+1) 对齐
            for o in 0..MAX_ORDER - 1 {
                let pair = 1usize << (o + 1);
                let mut idx = zone.start & !(pair - 1);
                if idx < zone.start {
                    idx += pair;
                }
                while idx + pair <= zone.end {
                    let lo = self.frame(idx);
                    let hi = self.frame(idx + (1 << o));
                    if lo.page_type() == PageType::Buddy
                        && lo.order() == o
                        && hi.page_type() == PageType::Buddy
                        && hi.order() == o
                    {
                        self.list_remove(&mut heads, idx, o);
                        self.list_remove(&mut heads, idx + (1 << o), o);
                        self.list_push(&mut heads, idx, o + 1);
                    }
                    idx += pair;
                }
            }
        }
    }

    fn zone_of(&self, frame: PhysFrameNr) -> ZoneKind {
        for zone in &self.zones {
            if zone.contains(frame) {
                return zone.kind;
            }
        }
        ZoneKind::Normal
    }

    /// zone 扫描顺序：偏好的 zone 在前，其余按 DMA → Normal → High
    fn zone_scan_order(flags: AllocFlags) -> [usize; ZONE_COUNT] {
        if flags.contains(AllocFlags::DMA) {
            [0, 1, 2]
        } else if flags.contains(AllocFlags::HIGHMEM) {
            [2, 0, 1]
        } else {
            [1, 0, 2]
        }
    }

    /// 分配 2^order 个连续页帧
    ///
    /// 返回块头帧。块内数据未初始化（除非带 `AllocFlags::ZERO`），
    /// 头帧描述符的 refcount 置 1、order 记录分配大小。
    pub fn alloc_pages(&self, order: usize, flags: AllocFlags) -> Result<PhysFrame, MmError> {
        if order >= MAX_ORDER {
            return Err(MmError::InvalidOrder);
        }
        let scan = Self::zone_scan_order(flags);

        // 第一遍：尊重水位
        for &zi in &scan {
            let zone = &self.zones[zi];
            if zone.spanned() == 0 || zone.free() < (1 << order) + zone.watermark_min {
                continue;
            }
            if let Some(idx) = self.zone_alloc(zone, order) {
                return Ok(self.finish_alloc(idx, order, flags));
            }
        }

        // 第二遍：忽略水位
        for &zi in &scan {
            let zone = &self.zones[zi];
            if zone.spanned() == 0 {
                continue;
            }
            if let Some(idx) = self.zone_alloc(zone, order) {
                return Ok(self.finish_alloc(idx, order, flags));
            }
        }

        // 回收挂钩，之后重试一遍
        if self.try_reclaim(order) > 0 {
            for &zi in &scan {
                let zone = &self.zones[zi];
                if zone.spanned() == 0 {
                    continue;
                }
                if let Some(idx) = self.zone_alloc(zone, order) {
                    return Ok(self.finish_alloc(idx, order, flags));
                }
            }
        }

        log::debug!("buddy: out of memory for order {} ({:?})", order, flags);
        Err(MmError::OutOfMemory)
    }

    fn finish_alloc(&self, idx: PhysFrameNr, order: usize, flags: AllocFlags) -> PhysFrame {
        if flags.contains(AllocFlags::ZERO) {
            unsafe { ptr::write_bytes(self.mem.frame_ptr(idx), 0, PAGE_SIZE << order) };
        }
        PhysFrame::new(idx)
    }

    /// 在单个 zone 内分配：找到足够大的块，逐级分割
    fn zone_alloc(&self, zone: &Zone, order: usize) -> Option<PhysFrameNr> {
        let mut heads = zone.free_area.lock();
        for o in order..MAX_ORDER {
            let idx = heads[o];
            if idx == FRAME_NIL {
                continue;
            }
            self.list_remove(&mut heads, idx, o);

            // 分割：保留前半，后半（伙伴）挂回低一级链表
            let mut cur = o;
            while cur > order {
                cur -= 1;
                self.list_push(&mut heads, idx + (1 << cur), cur);
            }

            let page = self.frame(idx);
            page.clear_flags();
            page.set_page_type(PageType::Normal);
            page.set_order(order);
            page.set_private(0);
            page.set_refcount(1);
            zone.free_pages.fetch_sub(1 << order, Ordering::Relaxed);
            return Some(idx);
        }
        None
    }

    /// 释放 2^order 个连续页帧
    ///
    /// `order` 必须与分配时一致，块头帧必须按 2^order 对齐。
    /// 与空闲伙伴逐级合并后挂入所属 zone 的链表。
    pub fn free_pages(&self, frame: PhysFrame, order: usize) -> Result<(), MmError> {
        if order >= MAX_ORDER {
            return Err(MmError::InvalidOrder);
        }
        let idx = frame.number;
        if idx < self.reserved || idx >= self.nframes {
            return Err(MmError::InvalidArgument);
        }
        if idx & ((1 << order) - 1) != 0 {
            return Err(MmError::InvalidOrder);
        }

        let page = self.frame(idx);
        match page.page_type() {
            PageType::Buddy | PageType::Free => return Err(MmError::DoubleFree),
            _ => {}
        }
        if page.order() != order {
            return Err(MmError::InvalidOrder);
        }
        if page.refcount() != 1 {
            return Err(MmError::InvalidArgument);
        }

        page.set_refcount(0);
        page.set_private(0);
        page.clear_flags();

        let zone = &self.zones[page.zone_id() as usize];
        let mut heads = zone.free_area.lock();

        let mut cur = idx;
        let mut o = order;
        while o + 1 < MAX_ORDER {
            let buddy = cur ^ (1 << o);
            if !zone.contains(buddy) || buddy < self.reserved {
                break;
            }
            let bp = self.frame(buddy);
            if bp.page_type() != PageType::Buddy || bp.order() != o {
                break;
            }
            self.list_remove(&mut heads, buddy, o);
            // 合并后以地址较小者为块头
            cur &= !(1 << o);
            o += 1;
        }
        self.list_push(&mut heads, cur, o);
        zone.free_pages.fetch_add(1 << order, Ordering::Relaxed);
        Ok(())
    }

    /// 内存回收挂钩
    ///
    /// 本层没有可回收来源，返回回收的帧数（当前恒为 0）。
    /// 页缓存驱逐由上层在分配失败时主动触发。
    fn try_reclaim(&self, _order: usize) -> usize {
        0
    }

    // ========== 链表操作（持有 zone 锁时调用） ==========

    fn list_push(&self, heads: &mut [PhysFrameNr; MAX_ORDER], idx: PhysFrameNr, order: usize) {
        let page = self.frame(idx);
        page.set_page_type(PageType::Buddy);
        page.set_order(order);
        page.set_prev_free(FRAME_NIL);
        page.set_next_free(heads[order]);
        if heads[order] != FRAME_NIL {
            self.frame(heads[order]).set_prev_free(idx);
        }
        heads[order] = idx;
    }

    fn list_remove(&self, heads: &mut [PhysFrameNr; MAX_ORDER], idx: PhysFrameNr, order: usize) {
        let page = self.frame(idx);
        let prev = page.prev_free();
        let next = page.next_free();
        if prev != FRAME_NIL {
            self.frame(prev).set_next_free(next);
        } else {
            heads[order] = next;
        }
        if next != FRAME_NIL {
            self.frame(next).set_prev_free(prev);
        }
        page.set_next_free(FRAME_NIL);
        page.set_prev_free(FRAME_NIL);
        page.set_page_type(PageType::Free);
    }

    // ========== 帧访问 ==========

    /// 帧描述符
    pub fn frame_desc(&self, frame: PhysFrame) -> &Page {
        self.frame(frame.number)
    }

    #[inline]
    pub(crate) fn frame(&self, idx: PhysFrameNr) -> &Page {
        debug_assert!(idx < self.nframes);
        unsafe { &*self.frames.add(idx) }
    }

    /// 块头帧对应的物理地址
    pub fn frame_phys(&self, frame: PhysFrame) -> PhysAddr {
        self.mem.phys_of(frame.number)
    }

    /// 块头帧对应的内核访问指针
    pub fn page_ptr(&self, frame: PhysFrame) -> *mut u8 {
        self.mem.frame_ptr(frame.number)
    }

    /// 内核指针反查帧索引
    pub fn frame_index_of(&self, ptr: *const u8) -> Option<PhysFrameNr> {
        self.mem.frame_index_of(ptr)
    }

    // ========== 统计 ==========

    pub fn total_frames(&self) -> usize {
        self.nframes
    }

    pub fn reserved_frames(&self) -> usize {
        self.reserved
    }

    /// 可参与分配的帧数
    pub fn usable_frames(&self) -> usize {
        self.nframes - self.reserved
    }

    /// 当前空闲帧数
    pub fn free_frames(&self) -> usize {
        self.zones.iter().map(|z| z.free()).sum()
    }

    pub fn stats(&self) -> BuddyStats {
        let mut zones = [ZoneStats {
            kind: ZoneKind::Dma,
            spanned: 0,
            free: 0,
            watermark_min: 0,
            free_blocks: [0; MAX_ORDER],
        }; ZONE_COUNT];

        for (zi, zone) in self.zones.iter().enumerate() {
            let heads = zone.free_area.lock();
            let mut blocks = [0usize; MAX_ORDER];
            for (o, blocks_o) in blocks.iter_mut().enumerate() {
                let mut idx = heads[o];
                while idx != FRAME_NIL {
                    *blocks_o += 1;
                    idx = self.frame(idx).next_free();
                }
            }
            zones[zi] = ZoneStats {
                kind: zone.kind,
                spanned: zone.spanned(),
                free: zone.free(),
                watermark_min: zone.watermark_min,
                free_blocks: blocks,
            };
        }

        BuddyStats {
            total_frames: self.nframes,
            reserved_frames: self.reserved,
            free_frames: self.free_frames(),
            zones,
        }
    }

    /// 遍历所有空闲块（调试用）：(块头帧, order)
    pub fn free_block_list(&self) -> Vec<(PhysFrameNr, usize)> {
        let mut out = Vec::new();
        for zone in &self.zones {
            let heads = zone.free_area.lock();
            for (o, &head) in heads.iter().enumerate() {
                let mut idx = head;
                while idx != FRAME_NIL {
                    out.push((idx, o));
                    idx = self.frame(idx).next_free();
                }
            }
        }
        out
    }
}
