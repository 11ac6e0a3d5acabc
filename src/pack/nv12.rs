// ============================================================================
// src/pack/nv12.rs - NV12 輝度/色差ペアのまとめ割り当て
//
// 固定のレイアウト表を先頭から走査し、残りペア数・輝度幅・アライメント
// 条件を満たす最初のエントリで割り当てを試みる。エントリ内のどれかの
// allocate が失敗したら、その試行で確保した分を解放して次のエントリへ進む。
// 末尾の2エントリ（1ペア/1割り当て、1ペア/2割り当て）は最後の受け皿。
//
// 輝度(Y)は 8bit ビュー、色差(UV)は同じスロットの 16bit ビューで参照する。
// 幅はすべてスロット単位:
//   y  = ceil(width / 64)
//   uv = ceil(ceil(width / 2) / 64)
// ============================================================================

use alloc::vec::Vec;

use crate::container::Point;
use crate::engine::{AllocRequest, TilerEngine};
use crate::error::{TilerError, TilerResult};
use crate::geom::{SysAddr, TilerFormat};
use crate::registry::{Caller, Gid};

/// スロット数の式 `base + y·Y + uv·UV`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotExpr {
    pub base: u16,
    pub y: u16,
    pub uv: u16,
}

impl SlotExpr {
    pub const fn eval(&self, y: usize, uv: usize) -> usize {
        self.base as usize + self.y as usize * y + self.uv as usize * uv
    }
}

const fn slots(base: u16) -> SlotExpr {
    SlotExpr { base, y: 0, uv: 0 }
}

const fn expr(base: u16, y: u16, uv: u16) -> SlotExpr {
    SlotExpr { base, y, uv }
}

/// ペア内の1面の置き場所: 何番目の割り当ての、先頭から何スロット目か
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanePlace {
    pub alloc: u8,
    pub at: SlotExpr,
}

const fn at(alloc: u8, at: SlotExpr) -> PlanePlace {
    PlanePlace { alloc, at }
}

/// NV12 レイアウト表の1エントリ
#[derive(Debug)]
pub struct Nv12Layout {
    /// 残りペア数がこれ以上のときだけ使う
    pub min_pairs: usize,
    /// 輝度幅の上限（スロット）。None は無制限
    pub max_y: Option<usize>,
    /// 各面をページ境界に置くので、アライン要求でも使える
    pub aligned_ok: bool,
    /// 割り当て幅（スロット）
    pub allocs: &'static [SlotExpr],
    /// (Y, UV) の置き場所
    pub pairs: &'static [(PlanePlace, PlanePlace)],
}

impl Nv12Layout {
    fn accepts(&self, remaining: usize, y: usize, aligned: bool) -> bool {
        remaining >= self.min_pairs
            && self.max_y.is_none_or(|max| y <= max)
            && (self.aligned_ok || !aligned)
    }
}

/// NV12 レイアウト表（手調整済みの固定データ、順序に意味がある）
pub static LAYOUTS: [Nv12Layout; 5] = [
    // 4ペアを 64 + 32 スロットに詰める
    Nv12Layout {
        min_pairs: 4,
        max_y: Some(16),
        aligned_ok: false,
        allocs: &[slots(64), slots(32)],
        pairs: &[
            (at(0, slots(0)), at(0, slots(16))),
            (at(0, slots(24)), at(0, slots(40))),
            (at(0, slots(48)), at(1, slots(0))),
            (at(1, slots(8)), at(1, slots(24))),
        ],
    },
    // Y UV Y UV を隙間なく並べる
    Nv12Layout {
        min_pairs: 2,
        max_y: Some(32),
        aligned_ok: false,
        allocs: &[expr(0, 2, 2)],
        pairs: &[
            (at(0, slots(0)), at(0, expr(0, 1, 0))),
            (at(0, expr(0, 1, 1)), at(0, expr(0, 2, 1))),
        ],
    },
    Nv12Layout {
        min_pairs: 2,
        max_y: Some(32),
        aligned_ok: true,
        allocs: &[slots(64), slots(64)],
        pairs: &[
            (at(0, slots(0)), at(0, slots(32))),
            (at(1, slots(0)), at(1, slots(32))),
        ],
    },
    Nv12Layout {
        min_pairs: 1,
        max_y: Some(32),
        aligned_ok: true,
        allocs: &[slots(64)],
        pairs: &[(at(0, slots(0)), at(0, slots(32)))],
    },
    // Y と UV を別々に割り当てる
    Nv12Layout {
        min_pairs: 1,
        max_y: None,
        aligned_ok: true,
        allocs: &[expr(0, 1, 0), expr(0, 0, 1)],
        pairs: &[(at(0, slots(0)), at(1, slots(0)))],
    },
];

/// NV12 まとめ割り当ての結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedNv12 {
    pub y: Vec<SysAddr>,
    pub uv: Vec<SysAddr>,
    /// allocate が実際に返したアドレスのみ Some
    pub y_owner: Vec<Option<SysAddr>>,
    pub uv_owner: Vec<Option<SysAddr>>,
}

impl PackedNv12 {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

impl TilerEngine {
    /// NV12 ペアを `count` 組まとめて割り当てる
    ///
    /// どのエントリも成功しなくなった時点で打ち切り、それまでの分を返す。
    pub fn pack_nv12(
        &self,
        caller: Caller,
        count: usize,
        width: usize,
        height: usize,
        aligned: bool,
        gid: Gid,
    ) -> TilerResult<PackedNv12> {
        if width == 0
            || height == 0
            || !self.geometry().fits(TilerFormat::Bit8, width, height)
        {
            return Err(TilerError::InvalidArgument);
        }
        let y = width.div_ceil(TilerFormat::Bit8.slot_width());
        let uv = width.div_ceil(2).div_ceil(TilerFormat::Bit16.slot_width());

        let mut packed = PackedNv12::default();
        while packed.len() < count {
            let remaining = count - packed.len();
            let progressed = LAYOUTS
                .iter()
                .enumerate()
                .filter(|(_, layout)| layout.accepts(remaining, y, aligned))
                .any(|(i, layout)| {
                    let done = self.try_nv12_layout(caller, layout, y, uv, height, gid, &mut packed);
                    if !done {
                        log::debug!("[TILER] pack_nv12: layout {} failed, falling through", i);
                    }
                    done
                });
            if !progressed {
                break;
            }
        }
        if packed.len() < count {
            log::debug!("[TILER] pack_nv12: {} of {} packed", packed.len(), count);
        }
        Ok(packed)
    }

    /// 1エントリ分を割り当てる。失敗時はこの試行の割り当てを全て解放する
    #[allow(clippy::too_many_arguments)]
    fn try_nv12_layout(
        &self,
        caller: Caller,
        layout: &Nv12Layout,
        y: usize,
        uv: usize,
        height: usize,
        gid: Gid,
        packed: &mut PackedNv12,
    ) -> bool {
        let geom = self.geometry();
        let mut bases = Vec::with_capacity(layout.allocs.len());
        let mut origins = Vec::with_capacity(layout.allocs.len());
        for width in layout.allocs {
            let px = width.eval(y, uv) * TilerFormat::Bit8.slot_width();
            let req = AllocRequest::new(TilerFormat::Bit8, px, height).group(gid);
            let placed = self
                .pack_alloc(caller, req)
                .and_then(|base| geom.decode(base).map(|(_, pt)| (base, pt)));
            match placed {
                Some((base, pt)) => {
                    bases.push(base);
                    origins.push(pt);
                }
                None => {
                    self.free_attempt(&bases);
                    return false;
                }
            }
        }

        for (y_at, uv_at) in layout.pairs {
            let y_slots = y_at.at.eval(y, uv);
            let y_base = bases[y_at.alloc as usize];
            packed.y.push(y_base.add(y_slots * TilerFormat::Bit8.slot_row_bytes()));
            packed.y_owner.push((y_slots == 0).then_some(y_base));

            let uv_slots = uv_at.at.eval(y, uv);
            let origin = origins[uv_at.alloc as usize];
            let pt = Point::new(origin.x + uv_slots as u16, origin.y);
            packed.uv.push(geom.addr_of(TilerFormat::Bit16, pt));
            packed
                .uv_owner
                .push((uv_slots == 0).then_some(bases[uv_at.alloc as usize]));
        }
        true
    }
}
