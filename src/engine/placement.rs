// ============================================================================
// src/engine/placement.rs - ブロックの配置と割り当て
//
// ピクセル/バイト単位の要求をスロット単位に変換し、
//   1D   : コンテナから直接ランを予約（所有者はグループ）
//   2D   : 予約済みブロック → 既存エリアの隙間 → 新規エリア の順に配置
// した後、ページを取得してPATをプログラムする。
// 途中で失敗した場合は destroy_block で完全に巻き戻す。
// ============================================================================

use alloc::vec::Vec;

use super::{EngineState, TilerEngine, bump};
use crate::container::{Point, TileArea};
use crate::error::{TilerError, TilerResult};
use crate::geom::{PAGE_MASK, PAGE_SIZE, SysAddr, TilerFormat, align_up};
use crate::mm::PhysPage;
use crate::registry::{
    AreaInfo, BlockId, BlockInfo, BlockOwner, BlockPages, BlockQuery, Caller, Gid, GroupId,
};

/// 割り当て要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub fmt: TilerFormat,
    /// 2Dはピクセル、PAGEはバイト
    pub width: usize,
    /// PAGEでは width と掛け合わせた値が長さになる
    pub height: usize,
    /// バイト単位（0 = 既定値）
    pub align: usize,
    /// バイト単位
    pub offset: usize,
    pub gid: Gid,
}

impl AllocRequest {
    pub const fn new(fmt: TilerFormat, width: usize, height: usize) -> Self {
        Self {
            fmt,
            width,
            height,
            align: 0,
            offset: 0,
            gid: 0,
        }
    }

    pub const fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub const fn group(mut self, gid: Gid) -> Self {
        self.gid = gid;
        self
    }
}

/// スロット単位に変換した配置パラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub fmt: TilerFormat,
    pub container: usize,
    /// 幅（スロット）。1Dではスロット数
    pub w: u16,
    pub h: u16,
    /// x 方向のアライメント（スロット）
    pub align: u16,
    /// アライメント内のオフセット（スロット）
    pub offs: u16,
    /// スロット内のバイトオフセット
    pub in_offs: usize,
    /// 1Dのスロット数
    pub slots: usize,
}

/// ブロックの裏付け方法
pub(crate) enum Backing {
    /// ページプールから取得
    Pool,
    /// 呼び出し元の既存バッファを解決
    User { vaddr: usize },
    /// 領域のみ（ダミーページでクリア）
    RegionOnly,
}

/// エリア内で幅 `w` を置ける位置を探す
///
/// `members` は x 順のメンバー配置。見つかれば (x0, 挿入位置) を返す。
pub(crate) fn find_fit(
    area: &TileArea,
    members: &[TileArea],
    w: u16,
    align: u16,
    offs: u16,
) -> Option<(u16, usize)> {
    let (w, align, offs) = (w as usize, align.max(1) as usize, offs as usize);
    // x はブロック終端の次の位置
    let mut x = area.p0.x as usize + w + offs;
    for (i, member) in members.iter().enumerate() {
        if x <= member.p0.x as usize {
            return Some(((x - w) as u16, i));
        }
        let next = (member.p1.x as usize + 1).saturating_sub(offs);
        x = align_up(next, align) + w + offs;
    }
    if x <= area.p1.x as usize + 1 {
        Some(((x - w) as u16, members.len()))
    } else {
        None
    }
}

impl EngineState {
    /// 要求をスロット単位に変換
    pub(crate) fn analyze(
        &self,
        fmt: TilerFormat,
        width: usize,
        height: usize,
        align: usize,
        offs: usize,
    ) -> TilerResult<Placement> {
        if width == 0 || height == 0 || align > PAGE_SIZE {
            return Err(TilerError::InvalidArgument);
        }
        if !self.geom.fits(fmt, width, height) {
            return Err(TilerError::InvalidArgument);
        }
        let container = self.config.container_index(fmt);
        let grid_w = self.config.grid_width as usize;
        let grid_h = self.config.grid_height as usize;

        if !fmt.is_2d() {
            let effective = match (align, self.config.default_align) {
                (0, 0) => PAGE_SIZE,
                (0, d) => d,
                (a, _) => a,
            };
            if offs > effective {
                return Err(TilerError::InvalidArgument);
            }
            let length = width.checked_mul(height).ok_or(TilerError::InvalidArgument)?;
            // ページ内オフセットは幅に含める
            let in_offs = offs & PAGE_MASK;
            let slots = length
                .checked_add(in_offs)
                .ok_or(TilerError::InvalidArgument)?
                .div_ceil(PAGE_SIZE);
            if slots > grid_w * grid_h {
                return Err(TilerError::InvalidArgument);
            }
            return Ok(Placement {
                fmt,
                container,
                w: slots.min(grid_w) as u16,
                h: 1,
                align: 1,
                offs: 0,
                in_offs,
                slots,
            });
        }

        let bpp = fmt.bpp();
        let slot_row = fmt.slot_row_bytes();
        let min_align = slot_row.max(self.config.granularity);
        let effective = match (align, self.config.default_align) {
            (0, 0) => min_align,
            (0, d) => d,
            (a, _) => a,
        };
        if offs > effective || offs % bpp != 0 {
            return Err(TilerError::InvalidArgument);
        }
        let align = align_up(effective, min_align);

        // 粒度未満のオフセットは幅を広げて吸収する
        let in_offs = offs % min_align;
        let mut width = width + in_offs / bpp;
        let offs = offs - in_offs;
        width = align_up(width, min_align / bpp);

        let x_area = width.div_ceil(fmt.slot_width());
        let y_area = height.div_ceil(fmt.slot_height());
        if x_area > grid_w || y_area > grid_h {
            return Err(TilerError::InvalidArgument);
        }
        Ok(Placement {
            fmt,
            container,
            w: x_area as u16,
            h: y_area as u16,
            align: (align / slot_row) as u16,
            offs: (offs / slot_row) as u16,
            in_offs,
            slots: x_area * y_area,
        })
    }

    /// グループ内に2Dブロックを配置（グローバルリストには未登録）
    fn place_2d(&mut self, group: GroupId, p: &Placement) -> TilerResult<BlockId> {
        let info = self.registry.groups.get(group).ok_or(TilerError::NotFound)?;
        let align = p.align.max(1);

        // 1. 同じ形の予約済みブロック
        let reserved = info.reserved.iter().copied().find(|&id| {
            self.registry.blocks.get(id).is_some_and(|b| {
                b.container == p.container
                    && b.area.height() == p.h
                    && b.area.width() == p.w
                    && b.area.p0.x % align == p.offs
            })
        });
        if let Some(id) = reserved {
            if let Some(g) = self.registry.groups.get_mut(group) {
                g.reserved.retain(|&b| b != id);
            }
            if let Some(block) = self.registry.blocks.get_mut(id) {
                block.fmt = p.fmt;
                block.addr = self.geom.addr_of(p.fmt, block.area.p0);
            }
            log::debug!("[TILER] consuming reserved block {:?}", id);
            return Ok(id);
        }

        // 2. 同じ高さの既存エリアの隙間
        let mut fit = None;
        for &area_id in &info.areas {
            let Some(area) = self.registry.areas.get(area_id) else {
                continue;
            };
            if area.container != p.container || area.area.height() != p.h {
                continue;
            }
            let members: Vec<TileArea> = area
                .blocks
                .iter()
                .filter_map(|&b| self.registry.blocks.get(b).map(|m| m.area))
                .collect();
            if let Some((x0, _)) = find_fit(&area.area, &members, p.w, align, p.offs) {
                fit = Some((area_id, x0, area.area));
                break;
            }
        }

        // 3. 新しいエリア
        let (area_id, x0, area) = match fit {
            Some(found) => found,
            None => {
                let band = p.fmt.band() as u16;
                let area_align = band.max(align);
                let grid_w = self.config.grid_width as usize;
                if p.w as usize + p.offs as usize > grid_w {
                    return Err(TilerError::InvalidArgument);
                }
                let area_w =
                    align_up(p.w as usize + p.offs as usize, area_align as usize).min(grid_w);
                let container = self
                    .containers
                    .get_mut(p.container)
                    .ok_or(TilerError::InvalidArgument)?;
                let area = container.reserve_2d(area_w as u16, p.h, area_align)?;
                let area_id = self.registry.areas.insert(AreaInfo {
                    container: p.container,
                    area,
                    blocks: Vec::new(),
                    group: Some(group),
                });
                if let Some(g) = self.registry.groups.get_mut(group) {
                    g.areas.push(area_id);
                }
                (area_id, area.p0.x + p.offs, area)
            }
        };

        let rect = TileArea::rect(
            Point::new(x0, area.p0.y),
            Point::new(x0 + p.w - 1, area.p1.y),
            area.stride,
        );
        let id = self.registry.blocks.insert(BlockInfo {
            fmt: p.fmt,
            container: p.container,
            area: rect,
            addr: self.geom.addr_of(p.fmt, rect.p0),
            width: 0,
            height: 0,
            pages: None,
            refs: 0,
            alloced: false,
            owner: Some(BlockOwner::Area(area_id)),
        });
        self.registry.insert_into_area(area_id, id);
        Ok(id)
    }

    /// 1Dブロックを配置
    fn place_1d(&mut self, group: GroupId, p: &Placement) -> TilerResult<BlockId> {
        let container = self
            .containers
            .get_mut(p.container)
            .ok_or(TilerError::InvalidArgument)?;
        let area = container.reserve_1d(p.slots)?;
        let id = self.registry.blocks.insert(BlockInfo {
            fmt: p.fmt,
            container: p.container,
            area,
            addr: self.geom.addr_of(p.fmt, area.p0),
            width: 0,
            height: 0,
            pages: None,
            refs: 0,
            alloced: false,
            owner: Some(BlockOwner::Group(group)),
        });
        if let Some(g) = self.registry.groups.get_mut(group) {
            g.onedim.push(id);
        }
        Ok(id)
    }

    /// ブロックを配置し、裏付けページをプログラムする
    pub(crate) fn alloc_block(
        &mut self,
        caller: Caller,
        req: &AllocRequest,
        backing: Backing,
    ) -> TilerResult<BlockId> {
        let p = self.analyze(req.fmt, req.width, req.height, req.align, req.offset)?;
        let process = self.registry.get_or_create_process(caller);
        let group = self.registry.get_or_create_group(process, req.gid)?;

        let placed = if p.fmt.is_2d() {
            self.place_2d(group, &p)
        } else {
            self.place_1d(group, &p)
        };
        let id = match placed {
            Ok(id) => id,
            Err(e) => {
                // 作ったばかりの空グループ/プロセスを片付ける
                self.registry.try_release_group(group);
                return Err(e);
            }
        };

        let Some(block) = self.registry.blocks.get_mut(id) else {
            return Err(TilerError::NotFound);
        };
        block.addr = block.addr.add(p.in_offs);
        block.width = if p.fmt.is_2d() { req.width } else { req.width * req.height };
        block.height = if p.fmt.is_2d() { req.height } else { 1 };
        block.alloced = true;
        block.refs = 1;
        let area = block.area;
        self.registry.global.push(id);

        if let Err(e) = self.back_block(id, caller, &area, backing) {
            self.destroy_block(id);
            return Err(e);
        }
        Ok(id)
    }

    /// 配置済みブロックにページを割り当ててPATをプログラム
    fn back_block(
        &mut self,
        id: BlockId,
        caller: Caller,
        area: &TileArea,
        backing: Backing,
    ) -> TilerResult<()> {
        let fmt = self
            .registry
            .blocks
            .get(id)
            .map(|b| b.fmt)
            .ok_or(TilerError::NotFound)?;
        if !self.can_remap(fmt) {
            return match backing {
                Backing::Pool => Ok(()),
                _ => Err(TilerError::NotPermitted),
            };
        }

        let pages = match backing {
            Backing::Pool => {
                let pages = self.pool.acquire(&mut *self.provider, area.size())?;
                if let Err(e) = self.pat.program(&mut *self.remap, area, &pages) {
                    log::warn!("[TILER] programming {} pages failed: {}", pages.len(), e);
                    self.pool.release(&mut *self.provider, pages, self.pressure);
                    // 割り当て失敗として報告する
                    return Err(TilerError::OutOfMemory);
                }
                BlockPages::Pool(pages)
            }
            Backing::User { vaddr } => {
                let len = area.size() * PAGE_SIZE;
                let pages = self.provider.resolve_user_pages(caller.pid, vaddr, len)?;
                if let Err(e) = self.pat.program(&mut *self.remap, area, &pages) {
                    self.provider.unpin_pages(&pages);
                    return Err(e.into());
                }
                BlockPages::Pinned(pages)
            }
            Backing::RegionOnly => {
                self.pat.clear(&mut *self.remap, area)?;
                return Ok(());
            }
        };
        if let Some(block) = self.registry.blocks.get_mut(id) {
            block.pages = Some(pages);
        }
        Ok(())
    }

    /// ブロックを取得して変更（呼び出し元アドレスから）
    fn lookup_mut(&mut self, addr: SysAddr) -> TilerResult<(BlockId, &mut BlockInfo)> {
        let id = self.lookup(addr)?;
        let block = self.registry.blocks.get_mut(id).ok_or(TilerError::NotFound)?;
        Ok((id, block))
    }
}

impl TilerEngine {
    /// ブロックを割り当て、システムアドレスを返す
    pub fn allocate(&self, caller: Caller, req: &AllocRequest) -> TilerResult<SysAddr> {
        let mut state = self.lock();
        match state.alloc_block(caller, req, Backing::Pool) {
            Ok(id) => {
                bump(&mut state.counters.allocations);
                let addr = state.registry.blocks.get(id).map(|b| b.addr);
                #[cfg(feature = "verbose_logging")]
                log::debug!("[TILER] pid {} allocated {:?} -> {:?}", caller.pid, req, addr);
                addr.ok_or(TilerError::NotFound)
            }
            Err(e) => {
                bump(&mut state.counters.alloc_failures);
                log::debug!("[TILER] pid {} allocation {:?} failed: {}", caller.pid, req, e);
                Err(e)
            }
        }
    }

    /// 作成者の保持を解除
    ///
    /// 他の参照（バッファハンドル）が残っていれば実際の破棄は遅延する。
    /// `addr` は allocate が返したアドレスそのものでなければならない。
    /// ブロック内部を指す別名（まとめ割り当ての非所有アドレス）は NotFound。
    pub fn free(&self, addr: SysAddr) -> TilerResult<()> {
        let mut state = self.lock();
        let id = state.lookup(addr)?;
        let owned = state
            .registry
            .blocks
            .get(id)
            .is_some_and(|b| b.alloced && b.addr == addr);
        if !owned {
            return Err(TilerError::NotFound);
        }
        state.try_free(id)?;
        bump(&mut state.counters.frees);
        Ok(())
    }

    /// 呼び出し元の既存バッファをグリッドにマップ
    pub fn map_existing(
        &self,
        caller: Caller,
        fmt: TilerFormat,
        width: usize,
        height: usize,
        gid: Gid,
        usr_addr: usize,
    ) -> TilerResult<SysAddr> {
        let mut state = self.lock();
        if !state.can_remap(fmt) {
            return Err(TilerError::NotPermitted);
        }
        let mut req = AllocRequest::new(fmt, width, height).group(gid);
        let vaddr = if fmt.is_2d() {
            usr_addr
        } else {
            // ページ内オフセットをブロックのアドレスに引き継ぐ
            req.offset = usr_addr & PAGE_MASK;
            usr_addr & !PAGE_MASK
        };
        let id = state.alloc_block(caller, &req, Backing::User { vaddr })?;
        state
            .registry
            .blocks
            .get(id)
            .map(|b| b.addr)
            .ok_or(TilerError::NotFound)
    }

    /// アドレスを含むブロックの情報
    pub fn query(&self, addr: SysAddr) -> TilerResult<BlockQuery> {
        let state = self.lock();
        let id = state.lookup(addr)?;
        state
            .registry
            .blocks
            .get(id)
            .map(|b| b.describe())
            .ok_or(TilerError::NotFound)
    }

    /// ページを持たない領域だけを割り当てる
    ///
    /// 領域はダミーページでクリアされる。(アドレス, 必要ページ数) を返す。
    pub fn allocate_region_only(
        &self,
        caller: Caller,
        fmt: TilerFormat,
        width: usize,
        height: usize,
        gid: Gid,
    ) -> TilerResult<(SysAddr, usize)> {
        let mut state = self.lock();
        if !state.can_remap(fmt) {
            return Err(TilerError::NotPermitted);
        }
        let req = AllocRequest::new(fmt, width, height).group(gid);
        let id = state.alloc_block(caller, &req, Backing::RegionOnly)?;
        bump(&mut state.counters.allocations);
        state
            .registry
            .blocks
            .get(id)
            .map(|b| (b.addr, b.area.size()))
            .ok_or(TilerError::NotFound)
    }

    /// 呼び出し元が用意したページを領域にプログラム
    pub fn map_pages(&self, addr: SysAddr, pages: &[PhysPage]) -> TilerResult<()> {
        let mut state = self.lock();
        let (_, block) = state.lookup_mut(addr)?;
        let (fmt, area, mapped) = (block.fmt, block.area, block.pages.is_some());
        if !state.can_remap(fmt) {
            return Err(TilerError::NotPermitted);
        }
        if mapped {
            return Err(TilerError::AlreadyInUse);
        }
        if pages.len() != area.size() {
            return Err(TilerError::InvalidArgument);
        }
        let state = &mut *state;
        if let Err(e) = state.pat.program(&mut *state.remap, &area, pages) {
            log::warn!("[TILER] map_pages at {} failed: {}", addr, e);
            return Err(TilerError::Fault);
        }
        let (_, block) = state.lookup_mut(addr)?;
        block.pages = Some(BlockPages::Caller(pages.to_vec()));
        Ok(())
    }

    /// 領域からページを外してダミーページに戻す
    pub fn unmap_pages(&self, addr: SysAddr) -> TilerResult<()> {
        let mut state = self.lock();
        let (_, block) = state.lookup_mut(addr)?;
        let area = block.area;
        let pages = match block.pages.take() {
            None => return Err(TilerError::NotFound),
            Some(pages @ BlockPages::Pool(_)) => {
                block.pages = Some(pages);
                return Err(TilerError::NotPermitted);
            }
            Some(pages) => pages,
        };
        let state = &mut *state;
        if let Err(e) = state.pat.clear(&mut *state.remap, &area) {
            log::warn!("[TILER] unmap_pages at {}: {}", addr, e);
        }
        state.release_backing(pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FormatSet, TilerConfig};
    use crate::sim::{SimPageProvider, SimRemapTable};
    use alloc::boxed::Box;

    fn engine_with(config: TilerConfig) -> (TilerEngine, SimPageProvider, SimRemapTable) {
        let provider = SimPageProvider::new();
        let table = SimRemapTable::new(config.grid_width, config.grid_height);
        let engine = TilerEngine::new(config, Box::new(provider.clone()), Box::new(table.clone()))
            .unwrap();
        (engine, provider, table)
    }

    fn engine() -> (TilerEngine, SimPageProvider, SimRemapTable) {
        engine_with(TilerConfig::default())
    }

    const K: Caller = Caller::kernel(100);

    #[test]
    fn test_find_fit_before_between_and_after() {
        let area = TileArea::rect(Point::new(0, 0), Point::new(63, 0), 256);
        let member = |x0: u16, x1: u16| TileArea::rect(Point::new(x0, 0), Point::new(x1, 0), 256);

        assert_eq!(find_fit(&area, &[], 4, 2, 0), Some((0, 0)));
        assert_eq!(find_fit(&area, &[member(4, 7)], 4, 2, 0), Some((0, 0)));
        assert_eq!(find_fit(&area, &[member(0, 3)], 4, 2, 0), Some((4, 1)));
        assert_eq!(find_fit(&area, &[member(0, 4), member(10, 15)], 4, 2, 0), Some((6, 1)));
        // オフセット位相を保つ
        assert_eq!(find_fit(&area, &[member(1, 4)], 2, 4, 1), Some((5, 1)));
        assert_eq!(find_fit(&area, &[member(0, 61)], 4, 2, 0), None);
    }

    #[test]
    fn test_analyze_2d_units() {
        let (engine, _, _) = engine();
        let state = engine.lock();
        // 8bit: 64px は128バイト粒度に揃えられて2スロット
        let p = state.analyze(TilerFormat::Bit8, 64, 64, 0, 0).unwrap();
        assert_eq!((p.w, p.h, p.align, p.offs), (2, 1, 2, 0));

        let p = state.analyze(TilerFormat::Bit32, 100, 33, PAGE_SIZE, 256).unwrap();
        // 幅 100px + 0 → 128px 粒度の倍数で 4 スロット、高さ 2 スロット
        assert_eq!((p.w, p.h, p.align, p.offs, p.in_offs), (4, 2, 32, 2, 0));

        let p = state.analyze(TilerFormat::Bit16, 10, 1, 0, 64).unwrap();
        assert_eq!(p.in_offs, 64);
        assert_eq!(p.w, 1);
    }

    #[test]
    fn test_analyze_rejects_bad_arguments() {
        let (engine, _, _) = engine();
        let state = engine.lock();
        let bad = [
            (TilerFormat::Bit8, 0, 64, 0, 0),
            (TilerFormat::Bit8, 64, 0, 0, 0),
            (TilerFormat::Bit8, 64, 64, PAGE_SIZE * 2, 0),
            (TilerFormat::Bit8, 64, 64, 256, 512),
            (TilerFormat::Bit16, 64, 64, 0, 1),
            (TilerFormat::Bit8, 64 * 257, 64, 0, 0),
            (TilerFormat::Bit8, 64, 64 * 129, 0, 0),
            (TilerFormat::Page, PAGE_SIZE * 256 * 128 + 1, 1, 0, 0),
        ];
        for (fmt, w, h, align, offs) in bad {
            assert_eq!(
                state.analyze(fmt, w, h, align, offs),
                Err(TilerError::InvalidArgument),
                "{:?} {}x{} align {} offs {}",
                fmt,
                w,
                h,
                align,
                offs
            );
        }
    }

    #[test]
    fn test_huge_sizes_rejected_as_invalid() {
        let (engine, _, _) = engine();
        let k = Caller::kernel(1);
        let huge = [
            AllocRequest::new(TilerFormat::Bit8, usize::MAX, 64),
            AllocRequest::new(TilerFormat::Bit32, 64, usize::MAX),
            AllocRequest::new(TilerFormat::Bit16, usize::MAX, 64).offset(2),
            AllocRequest::new(TilerFormat::Page, usize::MAX, 1).offset(16),
            AllocRequest::new(TilerFormat::Page, usize::MAX / 2, 3),
        ];
        for req in huge {
            assert_eq!(engine.allocate(k, &req), Err(TilerError::InvalidArgument), "{:?}", req);
        }
        assert_eq!(
            engine.allocate_region_only(k, TilerFormat::Bit8, usize::MAX, usize::MAX, 0),
            Err(TilerError::InvalidArgument)
        );
        assert!(engine.allocate(k, &AllocRequest::new(TilerFormat::Bit8, 64, 64)).is_ok());
    }

    #[test]
    fn test_analyze_page_folds_offset() {
        let (engine, _, _) = engine();
        let state = engine.lock();
        let p = state.analyze(TilerFormat::Page, PAGE_SIZE, 1, 0, 16).unwrap();
        assert_eq!((p.slots, p.in_offs, p.h), (2, 16, 1));
    }

    #[test]
    fn test_allocate_programs_pat() {
        let (engine, _, table) = engine();
        let addr = engine
            .allocate(K, &AllocRequest::new(TilerFormat::Bit32, 32, 32))
            .unwrap();
        assert_eq!(addr.format(), Some(TilerFormat::Bit32));
        let (_, pt) = engine.geometry().decode(addr).unwrap();
        assert!(table.entry(pt.x, pt.y).is_some());

        let q = engine.query(addr).unwrap();
        assert_eq!(q.addr, addr);
        assert_eq!(
            q.dims,
            crate::registry::BlockDims::Rect {
                width: 32,
                height: 32,
                stride: PAGE_SIZE
            }
        );
    }

    #[test]
    fn test_same_height_blocks_share_area() {
        let (engine, _, _) = engine();
        let req = AllocRequest::new(TilerFormat::Bit8, 64, 64);
        let a = engine.allocate(K, &req).unwrap();
        let b = engine.allocate(K, &req).unwrap();
        assert_ne!(a, b);
        assert_eq!(engine.stats().areas, 1);

        // 高さが違えば別エリア
        engine
            .allocate(K, &AllocRequest::new(TilerFormat::Bit8, 64, 128))
            .unwrap();
        assert_eq!(engine.stats().areas, 2);
    }

    #[test]
    fn test_area_reused_after_member_freed() {
        let (engine, _, _) = engine();
        let req = AllocRequest::new(TilerFormat::Bit8, 64, 64);
        let a = engine.allocate(K, &req).unwrap();
        let b = engine.allocate(K, &req).unwrap();
        engine.free(a).unwrap();
        assert_eq!(engine.stats().areas, 1);
        // 空いた先頭の隙間に入る
        let c = engine.allocate(K, &req).unwrap();
        assert_eq!(c, a);
        engine.free(b).unwrap();
        engine.free(c).unwrap();
        assert_eq!(engine.stats().areas, 0);
        assert_eq!(engine.stats().groups, 0);
    }

    #[test]
    fn test_offset_preserved_in_address() {
        let (engine, _, _) = engine();
        let addr = engine
            .allocate(
                K,
                &AllocRequest::new(TilerFormat::Bit8, 100, 10)
                    .align(PAGE_SIZE)
                    .offset(192),
            )
            .unwrap();
        // 192 = 128 (スロット2つ分) + 64 (スロット内)
        let base = TilerFormat::Bit8.view_base();
        assert_eq!((addr.as_u32() - base) as usize % PAGE_SIZE, 192);
    }

    #[test]
    fn test_allocation_failure_rolls_back() {
        let config = TilerConfig {
            max_pages: 8,
            page_growth: 8,
            ..TilerConfig::default()
        };
        let (engine, provider, _) = engine_with(config);
        // 16スロットはキャップを超える
        let err = engine
            .allocate(K, &AllocRequest::new(TilerFormat::Page, 16 * PAGE_SIZE, 1))
            .unwrap_err();
        assert_eq!(err, TilerError::OutOfMemory);
        let stats = engine.stats();
        assert_eq!((stats.blocks, stats.groups, stats.processes), (0, 0, 0));
        assert_eq!(stats.used_slots, 0);
        // ダミー1枚 + 補充分
        assert_eq!(provider.live_pages(), 9);
    }

    #[test]
    fn test_pat_failure_reported_as_out_of_memory() {
        let (engine, _, table) = engine();
        table.fail_after(0);
        let err = engine
            .allocate(K, &AllocRequest::new(TilerFormat::Bit8, 64, 64))
            .unwrap_err();
        assert_eq!(err, TilerError::OutOfMemory);
        assert_eq!(engine.stats().areas, 0);
    }

    #[test]
    fn test_non_remappable_format() {
        let config = TilerConfig {
            remap_formats: FormatSet::TWO_D,
            ..TilerConfig::default()
        };
        let (engine, provider, _) = engine_with(config);
        // 割り当ては配置のみで成功する
        let addr = engine
            .allocate(K, &AllocRequest::new(TilerFormat::Page, PAGE_SIZE, 1))
            .unwrap();
        assert_eq!(provider.live_pages(), 1);
        assert_eq!(
            engine.map_existing(K, TilerFormat::Page, PAGE_SIZE, 1, 0, 0x1000),
            Err(TilerError::NotPermitted)
        );
        assert_eq!(
            engine.map_pages(addr, &[PhysPage::new(0x9000_0000)]),
            Err(TilerError::NotPermitted)
        );
    }

    #[test]
    fn test_map_existing_pins_and_unpins() {
        let (engine, provider, table) = engine();
        let addr = engine
            .map_existing(K, TilerFormat::Page, 3 * PAGE_SIZE, 1, 0, 0x2000_0100)
            .unwrap();
        assert_eq!(addr.page_offset(), 0x100);
        assert_eq!(provider.pinned_pages(), 4);
        let (_, pt) = engine.geometry().decode(addr).unwrap();
        assert!(table.entry(pt.x, pt.y).is_some());

        engine.free(addr).unwrap();
        assert_eq!(provider.pinned_pages(), 0);

        provider.set_fail_resolve(true);
        assert_eq!(
            engine.map_existing(K, TilerFormat::Page, PAGE_SIZE, 1, 0, 0x2000_0000),
            Err(TilerError::Fault)
        );
        assert_eq!(engine.stats().blocks, 0);
    }

    #[test]
    fn test_region_only_map_and_unmap() {
        let (engine, _, table) = engine();
        let (addr, count) = engine
            .allocate_region_only(K, TilerFormat::Bit16, 128, 32, 0)
            .unwrap();
        assert_eq!(count, 2);
        let (_, pt) = engine.geometry().decode(addr).unwrap();
        let dummy = table.entry(pt.x, pt.y);
        assert!(dummy.is_some());

        assert_eq!(engine.unmap_pages(addr), Err(TilerError::NotFound));
        assert_eq!(
            engine.map_pages(addr, &[PhysPage::new(0x9000_0000)]),
            Err(TilerError::InvalidArgument)
        );
        let pages = [PhysPage::new(0x9000_0000), PhysPage::new(0x9000_1000)];
        engine.map_pages(addr, &pages).unwrap();
        assert_eq!(table.entry(pt.x + 1, pt.y), Some(0x9000_1000));
        assert_eq!(engine.map_pages(addr, &pages), Err(TilerError::AlreadyInUse));

        engine.unmap_pages(addr).unwrap();
        assert_eq!(table.entry(pt.x + 1, pt.y), dummy);
        engine.free(addr).unwrap();
    }

    #[test]
    fn test_unmap_pool_backed_block_not_permitted() {
        let (engine, _, _) = engine();
        let addr = engine
            .allocate(K, &AllocRequest::new(TilerFormat::Bit8, 64, 64))
            .unwrap();
        assert_eq!(engine.unmap_pages(addr), Err(TilerError::NotPermitted));
        assert!(engine.query(addr).is_ok());
    }
}
