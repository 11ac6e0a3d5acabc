// ============================================================================
// src/lib.rs - タイラーメモリマネージャ
// ============================================================================
//!
//! # tiler_mm
//!
//! マルチコアSoCのタイル化メモリアロケータとPATリマップエンジン。
//!
//! バッファを固定サイズの2D/1Dスロットグリッドに配置し、物理ページが
//! そのグリッド座標に見えるようにPATをプログラムする。得られたブロックは
//! プロセス/グループ/バッファハンドルにまたがる参照カウントで追跡され、
//! プロセスが落ちても他プロセスが共有中のブロックは生き残る。
//!
//! ## 構成
//! - `container` : スロットグリッドの予約（既定実装 `GridContainer`）
//! - `mm`        : ページプールとPATステージング
//! - `registry`  : プロセス/グループ/エリア/ブロックの所有関係
//! - `engine`    : 割り当て・解放・バッファ登録・事前予約
//! - `pack`      : まとめ割り当て（同形状、NV12）
//! - `notify`    : 通知バス
//! - `control`   : 型付き制御インターフェース
//! - `diag`      : 統計と配置マップ
//! - `sim`       : ホスト用の模擬OS/PATバックエンド

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod container;
pub mod control;
pub mod diag;
pub mod engine;
pub mod error;
pub mod geom;
pub mod mm;
pub mod notify;
pub mod pack;
pub mod registry;
pub mod sim;

use alloc::boxed::Box;

pub use config::{FormatSet, TilerConfig};
pub use container::{GridContainer, Point, TileArea, TileContainer};
pub use control::{ControlCode, TilerRequest, TilerResponse, dispatch};
pub use diag::TilerStats;
pub use engine::{AllocRequest, MapSegment, ProcessMapping, ReserveShape, TilerEngine};
pub use error::{TilerError, TilerResult};
pub use geom::{Geometry, PAGE_SIZE, SysAddr, TilerFormat};
pub use mm::{PageProvider, PhysPage, RemapTable};
pub use notify::{EventKinds, NotifierFn, TilerEvent};
pub use pack::{PackedNv12, PackedUniform};
pub use registry::{BlockDims, BlockQuery, Caller, Gid, Pid};

// ============================================================================
// Global Instance
// ============================================================================

/// プロセス全体で共有するエンジン
static TILER: spin::Once<TilerEngine> = spin::Once::new();

/// グローバルエンジンを初期化
///
/// 2回目以降の呼び出しは AlreadyInUse。初期化に失敗した場合は再試行できる。
pub fn init_tiler(
    config: TilerConfig,
    provider: Box<dyn PageProvider>,
    remap: Box<dyn RemapTable>,
) -> TilerResult<&'static TilerEngine> {
    // 初期化クロージャを実行した呼び出し元だけが成功する
    let mut created = false;
    let engine = TILER.try_call_once(|| {
        created = true;
        TilerEngine::new(config, provider, remap)
    })?;
    if created {
        Ok(engine)
    } else {
        Err(TilerError::AlreadyInUse)
    }
}

/// グローバルエンジンを取得
pub fn tiler() -> Option<&'static TilerEngine> {
    TILER.get()
}
