//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Slab 分配器与 kmalloc
//!
//! 用于小对象的高效内存分配，减少伙伴系统的碎片。
//!
//! # 设计
//! - SlabCache: 管理特定大小对象的缓存，页内对象用 u16 索引
//!   串成侵入式空闲链
//! - slab 页本身从伙伴系统按 order-0 申请，full/partial/free
//!   三条页链表直接复用页描述符的链域
//! - KernelHeap: kmalloc/kzalloc/kfree 公共接口；小于等于
//!   2048 字节的请求进尺寸类缓存，更大的请求直接整页分配
//!
//! kfree 只看页描述符的归属标记就能区分 slab 对象和整页
//! 分配，不需要任何查找。
//!
//! # 尺寸类
//! 8, 16, 32, 64, 128, 256, 512, 1024, 2048 字节

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use crate::config::MAX_ORDER;

use super::buddy_allocator::{PhysicalAllocator, GFP_KERNEL};
use super::page::{PhysFrame, PhysFrameNr, PAGE_SIZE};
use super::page_desc::{PageType, FRAME_NIL};
use super::MmError;

/// 最小对象大小
const MIN_OBJECT_SIZE: usize = 8;

/// slab 管理的最大对象大小，超过走整页分配
pub const MAX_SLAB_OBJECT: usize = 2048;

/// 尺寸类数量
const NUM_KMALLOC_CACHES: usize = 9;

/// 尺寸类对象大小
const KMALLOC_SIZES: [usize; NUM_KMALLOC_CACHES] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

/// 尺寸类缓存名
const KMALLOC_NAMES: [&str; NUM_KMALLOC_CACHES] = [
    "kmalloc-8",
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
];

/// 页内空闲链的结束标记
const OBJ_NIL: u16 = 0xFFFF;

/// Slab 头部（存储在每个 slab 页的开头）
#[repr(C)]
struct SlabHeader {
    /// 第一个空闲对象的索引
    free_head: u16,
    /// 已分配对象数
    in_use: u16,
    _pad: [u16; 2],
}

/// 缓存标识：在 [`KernelHeap`] 中的下标，同时写入 slab 页
/// 描述符的 private 字段
pub type CacheId = usize;

/// 单个对象大小的 slab 缓存
pub struct SlabCache {
    name: &'static str,
    id: CacheId,
    object_size: usize,
    /// 对象槽间距（object_size 按 align 向上取整）
    stride: usize,
    /// 页内第一个对象的偏移
    obj_base: usize,
    objects_per_slab: usize,
    /// 页链表头（帧索引，FRAME_NIL 表示空）
    partial: PhysFrameNr,
    full: PhysFrameNr,
    free: PhysFrameNr,
    nr_partial: usize,
    nr_full: usize,
    nr_free: usize,
    alloc_count: usize,
    free_count: usize,
}

/// 单缓存统计
#[derive(Debug, Clone, Copy)]
pub struct SlabCacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub nr_partial: usize,
    pub nr_full: usize,
    pub nr_free: usize,
    pub alloc_count: usize,
    pub free_count: usize,
}

impl SlabCacheStats {
    /// 当前存活对象数
    pub fn live_objects(&self) -> usize {
        self.alloc_count - self.free_count
    }

    /// 缓存占用的页数
    pub fn pages(&self) -> usize {
        self.nr_partial + self.nr_full + self.nr_free
    }
}

impl SlabCache {
    /// 创建缓存并计算页内布局
    fn new(
        name: &'static str,
        object_size: usize,
        align: usize,
        id: CacheId,
    ) -> Result<Self, MmError> {
        if object_size < MIN_OBJECT_SIZE || object_size > MAX_SLAB_OBJECT {
            return Err(MmError::InvalidArgument);
        }
        // 空闲链用 u16 写在对象槽内，对齐至少 2 字节
        if !align.is_power_of_two() || align < 2 || align > PAGE_SIZE / 2 {
            return Err(MmError::InvalidArgument);
        }

        let stride = (object_size + align - 1) & !(align - 1);
        let obj_base = (core::mem::size_of::<SlabHeader>() + align - 1) & !(align - 1);
        let objects_per_slab = (PAGE_SIZE - obj_base) / stride;
        if objects_per_slab == 0 || objects_per_slab >= OBJ_NIL as usize {
            return Err(MmError::InvalidArgument);
        }

        Ok(Self {
            name,
            id,
            object_size,
            stride,
            obj_base,
            objects_per_slab,
            partial: FRAME_NIL,
            full: FRAME_NIL,
            free: FRAME_NIL,
            nr_partial: 0,
            nr_full: 0,
            nr_free: 0,
            alloc_count: 0,
            free_count: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// 分配一个对象
    pub fn alloc(&mut self, phys: &PhysicalAllocator) -> Result<*mut u8, MmError> {
        if self.partial == FRAME_NIL {
            if self.free != FRAME_NIL {
                // 优先复用完全空闲的 slab
                let idx = self.free;
                Self::list_remove(phys, &mut self.free, idx);
                self.nr_free -= 1;
                Self::list_push(phys, &mut self.partial, idx);
                self.nr_partial += 1;
            } else {
                self.grow(phys)?;
            }
        }

        let slab = self.partial;
        let base = phys.page_ptr(PhysFrame::new(slab));
        let header = unsafe { &mut *(base as *mut SlabHeader) };
        debug_assert!(header.free_head != OBJ_NIL, "partial slab with no free slot");

        let obj = header.free_head as usize;
        let ptr = unsafe { base.add(self.obj_base + obj * self.stride) };
        header.free_head = unsafe { *(ptr as *const u16) };
        header.in_use += 1;

        if header.in_use as usize == self.objects_per_slab {
            Self::list_remove(phys, &mut self.partial, slab);
            self.nr_partial -= 1;
            Self::list_push(phys, &mut self.full, slab);
            self.nr_full += 1;
        }

        self.alloc_count += 1;
        Ok(ptr)
    }

    /// 释放一个对象
    ///
    /// 指针必须指向本缓存某个 slab 页内的对象槽起始位置。
    pub fn free(&mut self, phys: &PhysicalAllocator, ptr: *mut u8) -> Result<(), MmError> {
        let idx = phys
            .frame_index_of(ptr as *const u8)
            .ok_or(MmError::InvalidArgument)?;
        let desc = phys.frame(idx);
        if desc.page_type() != PageType::Slab || desc.private() != self.id {
            return Err(MmError::InvalidArgument);
        }

        let base = phys.page_ptr(PhysFrame::new(idx));
        let off = (ptr as usize).wrapping_sub(base as usize);
        if off < self.obj_base || (off - self.obj_base) % self.stride != 0 {
            return Err(MmError::InvalidArgument);
        }
        let obj = (off - self.obj_base) / self.stride;
        if obj >= self.objects_per_slab {
            return Err(MmError::InvalidArgument);
        }

        let header = unsafe { &mut *(base as *mut SlabHeader) };
        if header.in_use == 0 {
            return Err(MmError::DoubleFree);
        }

        // 调试构建下扫描页内空闲链检测重复释放
        #[cfg(debug_assertions)]
        {
            let mut cur = header.free_head;
            while cur != OBJ_NIL {
                if cur as usize == obj {
                    return Err(MmError::DoubleFree);
                }
                cur = unsafe {
                    *(base.add(self.obj_base + cur as usize * self.stride) as *const u16)
                };
            }
        }

        unsafe { *(ptr as *mut u16) = header.free_head };
        header.free_head = obj as u16;
        let was_full = header.in_use as usize == self.objects_per_slab;
        header.in_use -= 1;

        if was_full {
            Self::list_remove(phys, &mut self.full, idx);
            self.nr_full -= 1;
            Self::list_push(phys, &mut self.partial, idx);
            self.nr_partial += 1;
        }
        if header.in_use == 0 {
            Self::list_remove(phys, &mut self.partial, idx);
            self.nr_partial -= 1;
            Self::list_push(phys, &mut self.free, idx);
            self.nr_free += 1;
        }

        self.free_count += 1;
        Ok(())
    }

    /// 把完全空闲的 slab 页归还伙伴系统，返回释放的页数
    pub fn shrink(&mut self, phys: &PhysicalAllocator) -> Result<usize, MmError> {
        let mut released = 0;
        while self.free != FRAME_NIL {
            let idx = self.free;
            Self::list_remove(phys, &mut self.free, idx);
            self.nr_free -= 1;
            phys.free_pages(PhysFrame::new(idx), 0)?;
            released += 1;
        }
        Ok(released)
    }

    /// 申请一个新 slab 页并挂入 partial 链表
    fn grow(&mut self, phys: &PhysicalAllocator) -> Result<(), MmError> {
        let frame = phys.alloc_pages(0, GFP_KERNEL)?;
        let desc = phys.frame_desc(frame);
        desc.set_page_type(PageType::Slab);
        desc.set_private(self.id);

        let base = phys.page_ptr(frame);
        let header = unsafe { &mut *(base as *mut SlabHeader) };
        header.free_head = 0;
        header.in_use = 0;
        header._pad = [0; 2];

        // 对象槽串成侵入式空闲链
        for i in 0..self.objects_per_slab {
            let next = if i + 1 == self.objects_per_slab {
                OBJ_NIL
            } else {
                (i + 1) as u16
            };
            unsafe { *(base.add(self.obj_base + i * self.stride) as *mut u16) = next };
        }

        Self::list_push(phys, &mut self.partial, frame.number);
        self.nr_partial += 1;
        Ok(())
    }

    pub fn stats(&self) -> SlabCacheStats {
        SlabCacheStats {
            name: self.name,
            object_size: self.object_size,
            objects_per_slab: self.objects_per_slab,
            nr_partial: self.nr_partial,
            nr_full: self.nr_full,
            nr_free: self.nr_free,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
        }
    }

    // ========== slab 页链表（复用页描述符链域，只改链接不改归属） ==========

    fn list_push(phys: &PhysicalAllocator, head: &mut PhysFrameNr, idx: PhysFrameNr) {
        let page = phys.frame(idx);
        page.set_prev_free(FRAME_NIL);
        page.set_next_free(*head);
        if *head != FRAME_NIL {
            phys.frame(*head).set_prev_free(idx);
        }
        *head = idx;
    }

    fn list_remove(phys: &PhysicalAllocator, head: &mut PhysFrameNr, idx: PhysFrameNr) {
        let page = phys.frame(idx);
        let prev = page.prev_free();
        let next = page.next_free();
        if prev != FRAME_NIL {
            phys.frame(prev).set_next_free(next);
        } else {
            *head = next;
        }
        if next != FRAME_NIL {
            phys.frame(next).set_prev_free(prev);
        }
        page.set_next_free(FRAME_NIL);
        page.set_prev_free(FRAME_NIL);
    }
}

/// 内核堆：kmalloc 尺寸类缓存 + 命名缓存 + 整页分配
pub struct KernelHeap {
    phys: Arc<PhysicalAllocator>,
    /// 缓存注册表，下标即 CacheId；只增不删
    caches: RwLock<Vec<Arc<Mutex<SlabCache>>>>,
}

impl KernelHeap {
    /// 创建内核堆并注册 kmalloc 尺寸类缓存
    pub fn new(phys: Arc<PhysicalAllocator>) -> Result<Self, MmError> {
        let mut caches = Vec::with_capacity(NUM_KMALLOC_CACHES);
        for (id, (&size, &name)) in KMALLOC_SIZES.iter().zip(KMALLOC_NAMES.iter()).enumerate() {
            caches.push(Arc::new(Mutex::new(SlabCache::new(
                name,
                size,
                MIN_OBJECT_SIZE,
                id,
            )?)));
        }
        log::info!("slab: {} kmalloc caches registered", NUM_KMALLOC_CACHES);
        Ok(Self {
            phys,
            caches: RwLock::new(caches),
        })
    }

    /// 注册一个命名对象缓存
    pub fn create_cache(
        &self,
        name: &'static str,
        object_size: usize,
        align: usize,
    ) -> Result<CacheId, MmError> {
        let mut caches = self.caches.write();
        let id = caches.len();
        let cache = SlabCache::new(name, object_size, align, id)?;
        caches.push(Arc::new(Mutex::new(cache)));
        log::debug!("slab: cache {} registered ({} bytes)", name, object_size);
        Ok(id)
    }

    /// 尺寸对应的 kmalloc 尺寸类（超过 MAX_SLAB_OBJECT 时为 None）
    fn kmalloc_index(size: usize) -> Option<CacheId> {
        KMALLOC_SIZES.iter().position(|&s| size <= s)
    }

    fn cache(&self, id: CacheId) -> Result<Arc<Mutex<SlabCache>>, MmError> {
        self.caches
            .read()
            .get(id)
            .cloned()
            .ok_or(MmError::InvalidArgument)
    }

    /// 从指定缓存分配一个对象
    pub fn cache_alloc(&self, id: CacheId) -> Result<*mut u8, MmError> {
        self.cache(id)?.lock().alloc(&self.phys)
    }

    /// 释放指定缓存的对象
    pub fn cache_free(&self, id: CacheId, ptr: *mut u8) -> Result<(), MmError> {
        self.cache(id)?.lock().free(&self.phys, ptr)
    }

    /// 收缩指定缓存
    pub fn cache_shrink(&self, id: CacheId) -> Result<usize, MmError> {
        self.cache(id)?.lock().shrink(&self.phys)
    }

    /// 收缩所有缓存，返回归还的页数
    pub fn shrink_all(&self) -> Result<usize, MmError> {
        let caches: Vec<_> = self.caches.read().iter().cloned().collect();
        let mut released = 0;
        for cache in caches {
            released += cache.lock().shrink(&self.phys)?;
        }
        Ok(released)
    }

    /// 分配内存
    ///
    /// 小于等于 [`MAX_SLAB_OBJECT`] 的请求进尺寸类缓存，更大的
    /// 请求向伙伴系统按整块申请并标记为 Direct。
    pub fn kmalloc(&self, size: usize) -> Result<*mut u8, MmError> {
        if size == 0 {
            return Err(MmError::InvalidArgument);
        }
        if let Some(id) = Self::kmalloc_index(size) {
            return self.cache_alloc(id);
        }

        // 整页路径
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let order = pages.next_power_of_two().trailing_zeros() as usize;
        if order >= MAX_ORDER {
            return Err(MmError::InvalidArgument);
        }
        let frame = self.phys.alloc_pages(order, GFP_KERNEL)?;
        self.phys.frame_desc(frame).set_page_type(PageType::Direct);
        Ok(self.phys.page_ptr(frame))
    }

    /// 分配并清零内存
    pub fn kzalloc(&self, size: usize) -> Result<*mut u8, MmError> {
        let ptr = self.kmalloc(size)?;
        unsafe { core::ptr::write_bytes(ptr, 0, size) };
        Ok(ptr)
    }

    /// 释放 kmalloc 分配的内存
    ///
    /// 归属由页描述符的标记决定：Slab 页转给对应缓存，Direct
    /// 页按记录的 order 还给伙伴系统。
    pub fn kfree(&self, ptr: *mut u8) -> Result<(), MmError> {
        if ptr.is_null() {
            return Err(MmError::InvalidArgument);
        }
        let idx = self
            .phys
            .frame_index_of(ptr as *const u8)
            .ok_or(MmError::InvalidArgument)?;
        let frame = PhysFrame::new(idx);
        let desc = self.phys.frame_desc(frame);

        match desc.page_type() {
            PageType::Slab => self.cache_free(desc.private(), ptr),
            PageType::Direct => {
                // 只接受块头指针
                if self.phys.page_ptr(frame) != ptr {
                    return Err(MmError::InvalidArgument);
                }
                let order = desc.order();
                self.phys.free_pages(frame, order)
            }
            PageType::Buddy | PageType::Free => Err(MmError::DoubleFree),
            _ => Err(MmError::InvalidArgument),
        }
    }

    /// 所有缓存的统计快照
    pub fn stats(&self) -> Vec<SlabCacheStats> {
        self.caches
            .read()
            .iter()
            .map(|c| c.lock().stats())
            .collect()
    }
}
