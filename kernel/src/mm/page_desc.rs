//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页描述符 (Page Descriptor)
//!
//! 为每个物理页帧维护元数据：
//! - 引用计数 (_refcount)
//! - 页标志位 (flags)
//! - 归属标记 (_type)：帧当前属于哪个分配路径
//! - 分配 order 与所属 zone
//! - private：归属相关的反向指针（slab cache id、页缓存槽位等）
//! - 链域 next_free/prev_free：伙伴空闲链、slab 页链、PCP 链复用
//!
//! 描述符数组本身放在被管理内存的起始处，由
//! [`super::buddy_allocator::PhysicalAllocator`] 在初始化时建立。

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

/// 描述符链域的空指针
pub const FRAME_NIL: usize = usize::MAX;

/// 页标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageFlag {
    /// 页已锁定（I/O 进行中）
    Locked = 1 << 0,
    /// 页已修改（需要回写）
    Dirty = 1 << 1,
    /// 页数据有效（已从后备存储读取）
    UpToDate = 1 << 2,
    /// 保留页（描述符数组等，不参与分配）
    Reserved = 1 << 3,
    /// 大页块的头部页（预留给未来的大页支持）
    Huge = 1 << 4,
}

/// 页标志位集合
#[derive(Debug, Default)]
pub struct PageFlags(AtomicU32);

impl PageFlags {
    /// 创建空的标志位集合
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// 获取原始值
    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// 测试标志位是否设置
    pub fn test(&self, flag: PageFlag) -> bool {
        self.0.load(Ordering::Relaxed) & (flag as u32) != 0
    }

    /// 设置标志位
    pub fn set(&self, flag: PageFlag) {
        self.0.fetch_or(flag as u32, Ordering::Release);
    }

    /// 清除标志位
    pub fn clear(&self, flag: PageFlag) {
        self.0.fetch_and(!(flag as u32), Ordering::Release);
    }

    /// 测试并设置标志位（返回旧值）
    pub fn test_and_set(&self, flag: PageFlag) -> bool {
        let bit = flag as u32;
        (self.0.fetch_or(bit, Ordering::AcqRel) & bit) != 0
    }

    /// 测试并清除标志位（返回旧值）
    pub fn test_and_clear(&self, flag: PageFlag) -> bool {
        let bit = flag as u32;
        (self.0.fetch_and(!bit, Ordering::AcqRel) & bit) != 0
    }

    /// 清除所有标志位
    pub fn clear_all(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// 帧归属标记
///
/// 每个帧在任意时刻恰好属于一个分配路径。kfree 依靠此标记
/// 区分 slab 对象和整页分配，双重释放检测也依赖它。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageType {
    /// 已初始化、尚未挂入任何链表（仅初始化期间出现）
    Free = 0,
    /// 伙伴系统空闲块（头帧）
    Buddy = 1,
    /// 普通已分配页（alloc_pages 直接调用者持有）
    Normal = 2,
    /// kmalloc 大对象的整页分配（头帧，order 记录在描述符）
    Direct = 3,
    /// Slab 分配器页（private = cache id）
    Slab = 4,
    /// 页缓存页（private = 缓存槽位）
    PageCache = 5,
    /// Per-CPU 页缓存中的空闲页
    PcpCached = 6,
}

/// 页描述符
///
/// 每个物理页帧对应一个 Page 结构体（64 字节，对齐到缓存行）。
/// 所有字段都是原子的；跨字段的一致性由持有对应链表锁的
/// 分配器保证。
#[repr(C, align(64))]
pub struct Page {
    /// 原子标志位
    flags: PageFlags,

    /// 引用计数：0 表示空闲，> 0 表示在使用
    _refcount: AtomicI32,

    /// 空闲块或已分配块的 order
    order: AtomicU32,

    /// 所属 zone 编号
    zone: AtomicU32,

    /// 帧归属标记
    _type: AtomicU32,

    /// 归属相关数据
    /// - Slab：cache id
    /// - PageCache：缓存槽位
    private: AtomicUsize,

    /// 链域：下一帧索引（FRAME_NIL 结尾）
    next_free: AtomicUsize,

    /// 链域：前一帧索引
    prev_free: AtomicUsize,
}

impl Page {
    /// 创建一个新的页描述符（初始化为空闲状态）
    pub const fn new() -> Self {
        Self {
            flags: PageFlags::new(),
            _refcount: AtomicI32::new(0),
            order: AtomicU32::new(0),
            zone: AtomicU32::new(0),
            _type: AtomicU32::new(PageType::Free as u32),
            private: AtomicUsize::new(0),
            next_free: AtomicUsize::new(FRAME_NIL),
            prev_free: AtomicUsize::new(FRAME_NIL),
        }
    }

    /// 初始化为保留页（描述符数组自身等）
    pub fn init_reserved(&self, zone: u32) {
        self.flags.clear_all();
        self.flags.set(PageFlag::Reserved);
        self._refcount.store(1, Ordering::Release);
        self.zone.store(zone, Ordering::Release);
        self._type.store(PageType::Normal as u32, Ordering::Release);
        self.private.store(0, Ordering::Release);
        self.next_free.store(FRAME_NIL, Ordering::Release);
        self.prev_free.store(FRAME_NIL, Ordering::Release);
    }

    /// 初始化为普通可用页
    pub fn init_free(&self, zone: u32) {
        self.flags.clear_all();
        self._refcount.store(0, Ordering::Release);
        self.order.store(0, Ordering::Release);
        self.zone.store(zone, Ordering::Release);
        self._type.store(PageType::Free as u32, Ordering::Release);
        self.private.store(0, Ordering::Release);
        self.next_free.store(FRAME_NIL, Ordering::Release);
        self.prev_free.store(FRAME_NIL, Ordering::Release);
    }

    // ========== 标志位操作 ==========

    #[inline]
    pub fn test_flag(&self, flag: PageFlag) -> bool {
        self.flags.test(flag)
    }

    #[inline]
    pub fn set_flag(&self, flag: PageFlag) {
        self.flags.set(flag);
    }

    #[inline]
    pub fn clear_flag(&self, flag: PageFlag) {
        self.flags.clear(flag);
    }

    #[inline]
    pub fn test_and_set_flag(&self, flag: PageFlag) -> bool {
        self.flags.test_and_set(flag)
    }

    #[inline]
    pub fn test_and_clear_flag(&self, flag: PageFlag) -> bool {
        self.flags.test_and_clear(flag)
    }

    #[inline]
    pub fn clear_flags(&self) {
        self.flags.clear_all();
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.test_flag(PageFlag::Locked)
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.test_flag(PageFlag::Reserved)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.test_flag(PageFlag::Dirty)
    }

    #[inline]
    pub fn is_uptodate(&self) -> bool {
        self.test_flag(PageFlag::UpToDate)
    }

    // ========== 引用计数操作 ==========

    /// 获取引用计数
    #[inline]
    pub fn refcount(&self) -> i32 {
        self._refcount.load(Ordering::Acquire)
    }

    /// 增加引用计数，返回增加后的值
    #[inline]
    pub fn get_page(&self) -> i32 {
        self._refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 减少引用计数，返回减少后的值；变为 0 时调用者应释放页面
    #[inline]
    pub fn put_page(&self) -> i32 {
        self._refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// 尝试增加引用计数（仅当 refcount > 0 时），成功返回 true
    #[inline]
    pub fn try_get_page(&self) -> bool {
        loop {
            let old = self._refcount.load(Ordering::Acquire);
            if old <= 0 {
                return false;
            }
            match self._refcount.compare_exchange_weak(
                old,
                old + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// 设置引用计数（仅用于初始化）
    #[inline]
    pub fn set_refcount(&self, count: i32) {
        self._refcount.store(count, Ordering::Release);
    }

    // ========== order / zone ==========

    #[inline]
    pub fn order(&self) -> usize {
        self.order.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn set_order(&self, order: usize) {
        self.order.store(order as u32, Ordering::Release);
    }

    #[inline]
    pub fn zone_id(&self) -> u32 {
        self.zone.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_zone(&self, zone: u32) {
        self.zone.store(zone, Ordering::Release);
    }

    // ========== 归属标记 ==========

    /// 获取帧归属标记
    #[inline]
    pub fn page_type(&self) -> PageType {
        match self._type.load(Ordering::Acquire) {
            1 => PageType::Buddy,
            2 => PageType::Normal,
            3 => PageType::Direct,
            4 => PageType::Slab,
            5 => PageType::PageCache,
            6 => PageType::PcpCached,
            _ => PageType::Free,
        }
    }

    /// 设置帧归属标记
    #[inline]
    pub fn set_page_type(&self, page_type: PageType) {
        self._type.store(page_type as u32, Ordering::Release);
    }

    // ========== 私有数据 ==========

    #[inline]
    pub fn private(&self) -> usize {
        self.private.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_private(&self, value: usize) {
        self.private.store(value, Ordering::Release);
    }

    // ========== 链域操作（分配器内部使用） ==========

    #[inline]
    pub(crate) fn next_free(&self) -> usize {
        self.next_free.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_next_free(&self, frame: usize) {
        self.next_free.store(frame, Ordering::Release);
    }

    #[inline]
    pub(crate) fn prev_free(&self) -> usize {
        self.prev_free.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_prev_free(&self, frame: usize) {
        self.prev_free.store(frame, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_flags() {
        let flags = PageFlags::new();

        assert!(!flags.test(PageFlag::Locked));
        assert!(!flags.test(PageFlag::Dirty));

        flags.set(PageFlag::Locked);
        assert!(flags.test(PageFlag::Locked));

        flags.set(PageFlag::Dirty);
        assert!(flags.test(PageFlag::Dirty));

        flags.clear(PageFlag::Locked);
        assert!(!flags.test(PageFlag::Locked));
        assert!(flags.test(PageFlag::Dirty));

        assert!(flags.test_and_clear(PageFlag::Dirty));
        assert!(!flags.test_and_clear(PageFlag::Dirty));
    }

    #[test]
    fn test_page_refcount() {
        let page = Page::new();

        assert_eq!(page.refcount(), 0);

        page.get_page();
        assert_eq!(page.refcount(), 1);

        page.get_page();
        assert_eq!(page.refcount(), 2);

        page.put_page();
        assert_eq!(page.refcount(), 1);

        page.put_page();
        assert_eq!(page.refcount(), 0);
    }

    #[test]
    fn test_try_get_page() {
        let page = Page::new();

        // refcount == 0 时不可获取
        assert!(!page.try_get_page());

        page.set_refcount(1);
        assert!(page.try_get_page());
        assert_eq!(page.refcount(), 2);
    }

    #[test]
    fn test_page_type_roundtrip() {
        let page = Page::new();
        assert_eq!(page.page_type(), PageType::Free);

        for ty in [
            PageType::Buddy,
            PageType::Normal,
            PageType::Direct,
            PageType::Slab,
            PageType::PageCache,
            PageType::PcpCached,
        ] {
            page.set_page_type(ty);
            assert_eq!(page.page_type(), ty);
        }
    }

    #[test]
    fn test_descriptor_size() {
        // 描述符数组的空间预算按 64 字节计算
        assert_eq!(core::mem::size_of::<Page>(), 64);
    }

    #[test]
    fn test_init_free_resets_state() {
        let page = Page::new();
        page.set_refcount(3);
        page.set_page_type(PageType::Slab);
        page.set_private(42);
        page.set_flag(PageFlag::Dirty);
        page.set_next_free(7);

        page.init_free(1);
        assert_eq!(page.refcount(), 0);
        assert_eq!(page.page_type(), PageType::Free);
        assert_eq!(page.private(), 0);
        assert!(!page.is_dirty());
        assert_eq!(page.zone_id(), 1);
        assert_eq!(page.next_free(), FRAME_NIL);
    }
}
