// ============================================================================
// src/pack/uniform.rs - 同形状バッファのまとめ割り当て
// ============================================================================

use alloc::vec::Vec;

use crate::engine::{AllocRequest, TilerEngine};
use crate::error::{TilerError, TilerResult};
use crate::geom::{PAGE_SIZE, SysAddr, TilerFormat, align_up};
use crate::registry::{Caller, Gid};

/// 1回の allocate でまとめるスロット幅の単位
const PACK_ALLOC_SLOTS: usize = 64;
/// 非アラインの1Dバッファを並べる間隔
const PACK_LINEAR_ALIGN: usize = 128;

/// まとめ割り当ての結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedUniform {
    pub addrs: Vec<SysAddr>,
    /// allocate が実際に返したアドレスのみ Some（解放にはこれを使う）
    pub owners: Vec<Option<SysAddr>>,
}

impl PackedUniform {
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    fn push(&mut self, addr: SysAddr, owner: Option<SysAddr>) {
        self.addrs.push(addr);
        self.owners.push(owner);
    }
}

impl TilerEngine {
    /// 同じ形のバッファを `count` 個まとめて割り当てる
    ///
    /// allocate が失敗した時点で打ち切り、それまでの分を返す。
    /// `aligned` なら各バッファの先頭をページ境界に置く。
    #[allow(clippy::too_many_arguments)]
    pub fn pack_uniform(
        &self,
        caller: Caller,
        count: usize,
        fmt: TilerFormat,
        width: usize,
        height: usize,
        aligned: bool,
        gid: Gid,
    ) -> TilerResult<PackedUniform> {
        if width == 0 || height == 0 || !self.geometry().fits(fmt, width, height) {
            return Err(TilerError::InvalidArgument);
        }
        let packed = if fmt.is_2d() {
            self.pack_uniform_2d(caller, count, fmt, width, height, aligned, gid)
        } else {
            let len = width.checked_mul(height).ok_or(TilerError::InvalidArgument)?;
            self.pack_uniform_1d(caller, count, len, aligned, gid)
        };
        if packed.len() < count {
            log::debug!("[TILER] pack_uniform: {} of {} packed", packed.len(), count);
        }
        Ok(packed)
    }

    #[allow(clippy::too_many_arguments)]
    fn pack_uniform_2d(
        &self,
        caller: Caller,
        count: usize,
        fmt: TilerFormat,
        width: usize,
        height: usize,
        aligned: bool,
        gid: Gid,
    ) -> PackedUniform {
        let til_width = fmt.slot_width();
        let bpt = fmt.slot_row_bytes();
        // 以降の幅はすべてスロット単位
        let buf_width = width.div_ceil(til_width);
        let alloc_width = align_up(buf_width, PACK_ALLOC_SLOTS);
        let map_width = PAGE_SIZE / bpt;
        let buf_map_width = align_up(buf_width, map_width);
        // 1ページ行あたりのバッファ数と、1割り当てあたりのページ行数
        let n_per_m = if aligned { 1 } else { buf_map_width / buf_width };
        let m_per_a = (alloc_width / buf_map_width).max(1);

        let mut packed = PackedUniform::default();
        while packed.len() < count {
            let n_alloc = (count - packed.len()).min(m_per_a * n_per_m);
            let m_alloc = n_alloc.div_ceil(n_per_m);
            let tiles =
                (m_alloc - 1) * buf_map_width + buf_width * (n_alloc - (m_alloc - 1) * n_per_m);

            let req = AllocRequest::new(fmt, til_width * tiles, height).group(gid);
            let Some(base) = self.pack_alloc(caller, req) else {
                break;
            };
            for i in 0..n_alloc {
                let (m, n) = (i / n_per_m, i % n_per_m);
                let addr = base.add(bpt * (m * buf_map_width + n * buf_width));
                packed.push(addr, (i == 0).then_some(base));
            }
        }
        packed
    }

    fn pack_uniform_1d(
        &self,
        caller: Caller,
        count: usize,
        len: usize,
        aligned: bool,
        gid: Gid,
    ) -> PackedUniform {
        let stride = if aligned {
            align_up(len, PAGE_SIZE)
        } else {
            align_up(len, PACK_LINEAR_ALIGN)
        };
        let per_alloc = (self.geometry().stride(TilerFormat::Page) / stride).max(1);

        let mut packed = PackedUniform::default();
        while packed.len() < count {
            let n_alloc = (count - packed.len()).min(per_alloc);
            let total = (n_alloc - 1) * stride + len;
            let req = AllocRequest::new(TilerFormat::Page, total, 1).group(gid);
            let Some(base) = self.pack_alloc(caller, req) else {
                break;
            };
            for i in 0..n_alloc {
                packed.push(base.add(i * stride), (i == 0).then_some(base));
            }
        }
        packed
    }
}
