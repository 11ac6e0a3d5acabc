// ============================================================================
// src/control.rs - 制御インターフェース
// ============================================================================
//!
//! # 制御インターフェース
//!
//! OSのリクエスト層から渡される型付き要求をエンジン操作に振り分ける。
//! バイナリ表現への変換はリクエスト層の責務で、ここでは扱わない。
//!
//! ## 設計原則
//! - 1要求 = 1エンジン操作
//! - 上限を超えるペイロードはエンジンに渡す前に InvalidArgument

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::MAX_BUFFER_BLOCKS;
use crate::engine::{AllocRequest, ProcessMapping, ReserveShape, TilerEngine};
use crate::error::{TilerError, TilerResult};
use crate::geom::{SysAddr, TilerFormat};
use crate::mm::PhysPage;
use crate::notify::EventKinds;
use crate::pack::{PackedNv12, PackedUniform};
use crate::registry::{BlockQuery, Caller, Gid};

// ============================================================================
// 要求コード
// ============================================================================

/// 要求コード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCode {
    // 基本
    Allocate = 0,
    Free = 1,
    MapExisting = 2,
    Query = 3,

    // バッファ共有
    RegisterBufferSet = 10,
    QueryBufferSet = 11,
    UnregisterBufferSet = 12,
    MapToProcess = 13,

    // 拡張割り当て
    AllocateExtended = 20,
    ReserveUniform = 21,
    AllocatePackedUniform = 22,
    AllocatePackedNv12 = 23,
    AllocateRegionOnly = 24,
    MapPages = 25,
    UnmapPages = 26,

    // イベント
    RegisterEventListener = 30,
    UnregisterEventListener = 31,
}

impl TryFrom<u32> for ControlCode {
    type Error = TilerError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ControlCode::Allocate),
            1 => Ok(ControlCode::Free),
            2 => Ok(ControlCode::MapExisting),
            3 => Ok(ControlCode::Query),
            10 => Ok(ControlCode::RegisterBufferSet),
            11 => Ok(ControlCode::QueryBufferSet),
            12 => Ok(ControlCode::UnregisterBufferSet),
            13 => Ok(ControlCode::MapToProcess),
            20 => Ok(ControlCode::AllocateExtended),
            21 => Ok(ControlCode::ReserveUniform),
            22 => Ok(ControlCode::AllocatePackedUniform),
            23 => Ok(ControlCode::AllocatePackedNv12),
            24 => Ok(ControlCode::AllocateRegionOnly),
            25 => Ok(ControlCode::MapPages),
            26 => Ok(ControlCode::UnmapPages),
            30 => Ok(ControlCode::RegisterEventListener),
            31 => Ok(ControlCode::UnregisterEventListener),
            _ => Err(TilerError::InvalidArgument),
        }
    }
}

// ============================================================================
// 要求と応答
// ============================================================================

/// 制御要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TilerRequest {
    Allocate {
        fmt: TilerFormat,
        width: usize,
        height: usize,
        gid: Gid,
    },
    Free(SysAddr),
    MapExisting {
        fmt: TilerFormat,
        width: usize,
        height: usize,
        gid: Gid,
        usr_addr: usize,
    },
    Query(SysAddr),
    RegisterBufferSet(Vec<SysAddr>),
    QueryBufferSet(u32),
    UnregisterBufferSet(u32),
    MapToProcess(u32),
    AllocateExtended(AllocRequest),
    ReserveUniform {
        count: usize,
        shapes: Vec<ReserveShape>,
        gid: Gid,
    },
    AllocatePackedUniform {
        count: usize,
        fmt: TilerFormat,
        width: usize,
        height: usize,
        aligned: bool,
        gid: Gid,
    },
    AllocatePackedNv12 {
        count: usize,
        width: usize,
        height: usize,
        aligned: bool,
        gid: Gid,
    },
    AllocateRegionOnly {
        fmt: TilerFormat,
        width: usize,
        height: usize,
        gid: Gid,
    },
    /// `page_count` は呼び出し元の申告値で、`pages` の長さと一致する必要がある
    MapPages {
        addr: SysAddr,
        page_count: usize,
        pages: Vec<PhysPage>,
    },
    UnmapPages(SysAddr),
    RegisterEventListener {
        kinds: EventKinds,
        target: String,
    },
    UnregisterEventListener(String),
}

impl TilerRequest {
    pub fn code(&self) -> ControlCode {
        match self {
            TilerRequest::Allocate { .. } => ControlCode::Allocate,
            TilerRequest::Free(_) => ControlCode::Free,
            TilerRequest::MapExisting { .. } => ControlCode::MapExisting,
            TilerRequest::Query(_) => ControlCode::Query,
            TilerRequest::RegisterBufferSet(_) => ControlCode::RegisterBufferSet,
            TilerRequest::QueryBufferSet(_) => ControlCode::QueryBufferSet,
            TilerRequest::UnregisterBufferSet(_) => ControlCode::UnregisterBufferSet,
            TilerRequest::MapToProcess(_) => ControlCode::MapToProcess,
            TilerRequest::AllocateExtended(_) => ControlCode::AllocateExtended,
            TilerRequest::ReserveUniform { .. } => ControlCode::ReserveUniform,
            TilerRequest::AllocatePackedUniform { .. } => ControlCode::AllocatePackedUniform,
            TilerRequest::AllocatePackedNv12 { .. } => ControlCode::AllocatePackedNv12,
            TilerRequest::AllocateRegionOnly { .. } => ControlCode::AllocateRegionOnly,
            TilerRequest::MapPages { .. } => ControlCode::MapPages,
            TilerRequest::UnmapPages(_) => ControlCode::UnmapPages,
            TilerRequest::RegisterEventListener { .. } => ControlCode::RegisterEventListener,
            TilerRequest::UnregisterEventListener(_) => ControlCode::UnregisterEventListener,
        }
    }
}

/// 制御応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TilerResponse {
    Done,
    Addr(SysAddr),
    Block(BlockQuery),
    Buffer(u32),
    BufferSet(Vec<BlockQuery>),
    Mapping(ProcessMapping),
    Reserved(usize),
    PackedUniform(PackedUniform),
    PackedNv12(PackedNv12),
    /// 領域のアドレスと、埋めるのに必要なページ数
    Region { addr: SysAddr, pages: usize },
}

// ============================================================================
// ディスパッチ
// ============================================================================

/// 要求をエンジン操作に振り分ける
pub fn dispatch(
    engine: &TilerEngine,
    caller: Caller,
    request: TilerRequest,
) -> TilerResult<TilerResponse> {
    #[cfg(feature = "verbose_logging")]
    log::trace!("[TILER] pid {} {:?}", caller.pid, request.code());

    match request {
        TilerRequest::Allocate {
            fmt,
            width,
            height,
            gid,
        } => {
            let req = AllocRequest::new(fmt, width, height).group(gid);
            engine.allocate(caller, &req).map(TilerResponse::Addr)
        }
        TilerRequest::Free(addr) => engine.free(addr).map(|_| TilerResponse::Done),
        TilerRequest::MapExisting {
            fmt,
            width,
            height,
            gid,
            usr_addr,
        } => engine
            .map_existing(caller, fmt, width, height, gid, usr_addr)
            .map(TilerResponse::Addr),
        TilerRequest::Query(addr) => engine.query(addr).map(TilerResponse::Block),
        TilerRequest::RegisterBufferSet(addrs) => engine
            .register_buffer(caller, &addrs)
            .map(TilerResponse::Buffer),
        TilerRequest::QueryBufferSet(id) => engine
            .query_buffer(caller, id)
            .map(TilerResponse::BufferSet),
        TilerRequest::UnregisterBufferSet(id) => engine
            .unregister_buffer(caller, id)
            .map(|_| TilerResponse::Done),
        TilerRequest::MapToProcess(id) => engine
            .map_to_process(caller, id)
            .map(TilerResponse::Mapping),
        TilerRequest::AllocateExtended(req) => {
            engine.allocate(caller, &req).map(TilerResponse::Addr)
        }
        TilerRequest::ReserveUniform { count, shapes, gid } => engine
            .reserve_uniform(caller, count, &shapes, gid)
            .map(TilerResponse::Reserved),
        TilerRequest::AllocatePackedUniform {
            count,
            fmt,
            width,
            height,
            aligned,
            gid,
        } => {
            if count > MAX_BUFFER_BLOCKS {
                return Err(TilerError::InvalidArgument);
            }
            engine
                .pack_uniform(caller, count, fmt, width, height, aligned, gid)
                .map(TilerResponse::PackedUniform)
        }
        TilerRequest::AllocatePackedNv12 {
            count,
            width,
            height,
            aligned,
            gid,
        } => {
            if count > MAX_BUFFER_BLOCKS {
                return Err(TilerError::InvalidArgument);
            }
            engine
                .pack_nv12(caller, count, width, height, aligned, gid)
                .map(TilerResponse::PackedNv12)
        }
        TilerRequest::AllocateRegionOnly {
            fmt,
            width,
            height,
            gid,
        } => engine
            .allocate_region_only(caller, fmt, width, height, gid)
            .map(|(addr, pages)| TilerResponse::Region { addr, pages }),
        TilerRequest::MapPages {
            addr,
            page_count,
            pages,
        } => {
            if page_count != pages.len() {
                return Err(TilerError::InvalidArgument);
            }
            engine.map_pages(addr, &pages).map(|_| TilerResponse::Done)
        }
        TilerRequest::UnmapPages(addr) => engine.unmap_pages(addr).map(|_| TilerResponse::Done),
        TilerRequest::RegisterEventListener { kinds, target } => engine
            .register_listener(kinds, &target)
            .map(|_| TilerResponse::Done),
        TilerRequest::UnregisterEventListener(target) => engine
            .unregister_listener(&target)
            .map(|_| TilerResponse::Done),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TilerConfig;
    use crate::sim::{SimPageProvider, SimRemapTable};
    use alloc::boxed::Box;

    const K: Caller = Caller::kernel(11);

    fn engine() -> TilerEngine {
        TilerEngine::new(
            TilerConfig::default(),
            Box::new(SimPageProvider::new()),
            Box::new(SimRemapTable::new(256, 128)),
        )
        .unwrap()
    }

    #[test]
    fn test_control_code_round_trip() {
        assert_eq!(ControlCode::try_from(23), Ok(ControlCode::AllocatePackedNv12));
        assert_eq!(ControlCode::try_from(4), Err(TilerError::InvalidArgument));
        assert_eq!(
            TilerRequest::UnmapPages(SysAddr::new(0)).code(),
            ControlCode::UnmapPages
        );
    }

    #[test]
    fn test_allocate_query_free() {
        let engine = engine();
        let request = TilerRequest::Allocate {
            fmt: TilerFormat::Bit32,
            width: 64,
            height: 64,
            gid: 0,
        };
        let Ok(TilerResponse::Addr(addr)) = dispatch(&engine, K, request) else {
            panic!("allocate failed");
        };
        let Ok(TilerResponse::Block(q)) = dispatch(&engine, K, TilerRequest::Query(addr)) else {
            panic!("query failed");
        };
        assert_eq!(q.fmt, TilerFormat::Bit32);
        assert_eq!(dispatch(&engine, K, TilerRequest::Free(addr)), Ok(TilerResponse::Done));
        assert_eq!(
            dispatch(&engine, K, TilerRequest::Free(addr)),
            Err(TilerError::NotFound)
        );
    }

    #[test]
    fn test_oversized_payloads_rejected() {
        let engine = engine();
        let packed = TilerRequest::AllocatePackedUniform {
            count: MAX_BUFFER_BLOCKS + 1,
            fmt: TilerFormat::Page,
            width: 100,
            height: 1,
            aligned: false,
            gid: 0,
        };
        assert_eq!(dispatch(&engine, K, packed), Err(TilerError::InvalidArgument));
        let addrs = alloc::vec![SysAddr::new(0x6000_0000); MAX_BUFFER_BLOCKS + 1];
        assert_eq!(
            dispatch(&engine, K, TilerRequest::RegisterBufferSet(addrs)),
            Err(TilerError::InvalidArgument)
        );
        assert_eq!(engine.stats().processes, 0);
    }

    #[test]
    fn test_map_pages_count_mismatch() {
        let engine = engine();
        let Ok(TilerResponse::Region { addr, pages }) = dispatch(
            &engine,
            K,
            TilerRequest::AllocateRegionOnly {
                fmt: TilerFormat::Bit8,
                width: 64,
                height: 64,
                gid: 0,
            },
        ) else {
            panic!("region allocation failed");
        };
        assert_eq!(pages, 2);
        let request = TilerRequest::MapPages {
            addr,
            page_count: 3,
            pages: alloc::vec![PhysPage::new(0x9000_0000), PhysPage::new(0x9000_1000)],
        };
        assert_eq!(dispatch(&engine, K, request), Err(TilerError::InvalidArgument));
    }
}
