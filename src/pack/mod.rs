// ============================================================================
// src/pack/mod.rs - まとめ割り当て
//
// 同じ形の小さなバッファや NV12 の輝度/色差ペアを、少数の allocate で
// 確保したブロックの中に詰め込む。個々のアドレスはブロック先頭からの
// 固定オフセットで作る。
//
// 各 allocate / free はそれぞれエンジンのロックを取る。
// allocate の失敗は致命的ではなく、それまでに詰めた分を返して打ち切る。
// ============================================================================

pub mod nv12;
pub mod uniform;

pub use nv12::{LAYOUTS, Nv12Layout, PackedNv12};
pub use uniform::PackedUniform;

use crate::engine::{AllocRequest, TilerEngine};
use crate::geom::{PAGE_SIZE, SysAddr};
use crate::registry::Caller;

/// 詰め込み用の割り当て。ページ境界に揃える
fn packed_request(req: AllocRequest) -> AllocRequest {
    req.align(PAGE_SIZE)
}

impl TilerEngine {
    /// 1回の試行で確保したブロックを全て返す
    fn free_attempt(&self, allocs: &[SysAddr]) {
        for &addr in allocs {
            if let Err(e) = self.free(addr) {
                log::warn!("[TILER] pack: freeing {} failed: {}", addr, e);
            }
        }
    }

    /// 詰め込み用に1ブロック確保（失敗は None）
    fn pack_alloc(&self, caller: Caller, req: AllocRequest) -> Option<SysAddr> {
        match self.allocate(caller, &packed_request(req)) {
            Ok(addr) => Some(addr),
            Err(e) => {
                log::debug!("[TILER] pack: {:?} failed: {}", req, e);
                None
            }
        }
    }
}
