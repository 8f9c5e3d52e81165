//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Lumen 内核核心内存管理引擎
//!
//! 三个紧耦合的子系统：
//! - 物理页分配器（伙伴系统，带 DMA/Normal/High 区划分）
//! - Slab / 通用分配器（kmalloc/kfree）
//! - 页缓存（文件页与内存映射的后备存储）
//!
//! 虚拟内存管理器与 VFS 作为外部协作者，通过 trait 接口接入
//! （`mm::AddressSpaceOps` 与 `mm::VnodeIo`）。
//!
//! 所有状态都由启动时构造的 [`mm::MemoryContext`] 持有，
//! 不使用全局单例，因此可以在宿主机上并行运行多个测试实例。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod errno;
pub mod mm;
