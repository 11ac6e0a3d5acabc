// ============================================================================
// src/engine/reserve.rs - ブロックの事前予約
//
// 同じ形のブロックを n 個、バンド幅のエリアにまとめて先に配置しておく。
// 予約ブロックはエリアのメンバーかつグループの reserved リストに載るが、
// グローバルリストには載らない（refs = 0, alloced = false）。
// 後続の allocate が同じ形を要求すると、そのまま消費される。
// ============================================================================

use alloc::vec::Vec;

use super::placement::Placement;
use super::{EngineState, TilerEngine};
use crate::config::MAX_BUFFER_BLOCKS;
use crate::container::{Point, TileArea};
use crate::error::{TilerError, TilerResult};
use crate::geom::{TilerFormat, align_up};
use crate::registry::{AreaInfo, BlockInfo, BlockOwner, Caller, Gid, GroupId};

/// 予約するブロックの形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveShape {
    pub fmt: TilerFormat,
    pub width: usize,
    pub height: usize,
    pub align: usize,
    pub offset: usize,
}

impl ReserveShape {
    pub const fn new(fmt: TilerFormat, width: usize, height: usize) -> Self {
        Self {
            fmt,
            width,
            height,
            align: 0,
            offset: 0,
        }
    }
}

impl EngineState {
    /// 1つの形について `n` 個のブロックを予約し、予約できた数を返す
    fn reserve_blocks(&mut self, group: GroupId, n: usize, p: &Placement, shape: &ReserveShape) -> usize {
        let band = p.fmt.band();
        let (w, align, offs) = (p.w as usize, p.align.max(1) as usize, p.offs as usize);
        let area_align = band.max(align);
        let grid_w = self.config.grid_width as usize;
        if w + offs > grid_w {
            return 0;
        }

        // 1エリアに並べられる数
        let step = align_up(w, align);
        let per_area = if w + offs <= band {
            (band - offs - w) / step + 1
        } else {
            1
        };

        let mut reserved = 0;
        while reserved < n {
            let count = (n - reserved).min(per_area);
            let area_w = align_up((count - 1) * step + w + offs, area_align).min(grid_w);
            // 予約は最善努力: 入らなくなった時点で打ち切る
            let Some(container) = self.containers.get_mut(p.container) else {
                break;
            };
            let area = match container.reserve_2d(area_w as u16, p.h, area_align as u16) {
                Ok(area) => area,
                Err(e) => {
                    log::debug!("[TILER] reserve stopped after {} blocks: {}", reserved, e);
                    break;
                }
            };
            let area_id = self.registry.areas.insert(AreaInfo {
                container: p.container,
                area,
                blocks: Vec::new(),
                group: Some(group),
            });

            let mut placed = Vec::with_capacity(count);
            for i in 0..count {
                let x0 = area.p0.x as usize + offs + i * step;
                if x0 + w > area.p1.x as usize + 1 {
                    break;
                }
                let rect = TileArea::rect(
                    Point::new(x0 as u16, area.p0.y),
                    Point::new((x0 + w - 1) as u16, area.p1.y),
                    area.stride,
                );
                let id = self.registry.blocks.insert(BlockInfo {
                    fmt: p.fmt,
                    container: p.container,
                    area: rect,
                    addr: self.geom.addr_of(p.fmt, rect.p0),
                    width: shape.width,
                    height: shape.height,
                    pages: None,
                    refs: 0,
                    alloced: false,
                    owner: Some(BlockOwner::Area(area_id)),
                });
                if let Some(info) = self.registry.areas.get_mut(area_id) {
                    info.blocks.push(id);
                }
                placed.push(id);
            }
            if let Some(g) = self.registry.groups.get_mut(group) {
                g.areas.push(area_id);
                g.reserved.extend_from_slice(&placed);
            }
            reserved += placed.len();
            if placed.len() < count {
                break;
            }
        }
        reserved
    }
}

impl TilerEngine {
    /// 各形について `n` 個のブロックを事前予約
    ///
    /// PAGE フォーマットの形は何も予約しない。予約できたブロック数を返す。
    pub fn reserve_uniform(
        &self,
        caller: Caller,
        n: usize,
        shapes: &[ReserveShape],
        gid: Gid,
    ) -> TilerResult<usize> {
        if shapes.len() > MAX_BUFFER_BLOCKS {
            return Err(TilerError::InvalidArgument);
        }
        let mut state = self.lock();
        // 先に全ての形を検証する
        let mut placements = Vec::with_capacity(shapes.len());
        for shape in shapes.iter().filter(|s| s.fmt.is_2d()) {
            let p = state.analyze(shape.fmt, shape.width, shape.height, shape.align, shape.offset)?;
            placements.push((p, *shape));
        }
        if n == 0 || placements.is_empty() {
            return Ok(0);
        }

        let process = state.registry.get_or_create_process(caller);
        let group = state.registry.get_or_create_group(process, gid)?;
        let mut total = 0;
        for (p, shape) in &placements {
            total += state.reserve_blocks(group, n, p, shape);
        }
        // 何も予約できなかった場合の空グループ
        state.registry.try_release_group(group);
        log::debug!("[TILER] pid {} reserved {} blocks in group {}", caller.pid, total, gid);
        Ok(total)
    }

    /// グループの未使用の予約ブロックを全て解放
    pub fn unreserve(&self, caller: Caller, gid: Gid) -> TilerResult<()> {
        let mut state = self.lock();
        let process = state
            .registry
            .process_of(caller)
            .ok_or(TilerError::NotFound)?;
        let group = state
            .registry
            .find_group(process, gid)
            .ok_or(TilerError::NotFound)?;
        let reserved = match state.registry.groups.get_mut(group) {
            Some(info) => core::mem::take(&mut info.reserved),
            None => return Err(TilerError::NotFound),
        };
        for block in reserved {
            state.destroy_block(block);
        }
        Ok(())
    }
}
