// ============================================================================
// src/diag/mod.rs - 診断
// ============================================================================
//!
//! # 診断
//!
//! エンジン状態のスナップショットと、コンテナの配置マップ。
//!
//! ## 機能
//! - 登録数・スロット使用量の集計
//! - ページプール/PATの統計
//! - 操作カウンタ（`stats` フィーチャ）
//! - ASCII 配置マップ

use alloc::string::String;
use core::fmt::Write;

use crate::engine::{EngineState, OpCounters, TilerEngine};
use crate::mm::{PatStats, PoolStats};

/// マップの最大桁数
const MAP_COLUMNS: usize = 64;
/// マップの最大行数
const MAP_ROWS: usize = 32;

// ============================================================================
// Statistics
// ============================================================================

/// エンジン統計のスナップショット
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TilerStats {
    pub processes: usize,
    pub groups: usize,
    pub areas: usize,
    /// グローバルリスト上の生存ブロック
    pub blocks: usize,
    /// 未消費の予約ブロック
    pub reserved_blocks: usize,
    /// 孤児のエリアと1Dブロック
    pub orphans: usize,
    /// コンテナ上で使用中のスロット
    pub used_slots: usize,
    pub pool: PoolStats,
    pub pat: PatStats,
    pub ops: OpCounters,
}

impl EngineState {
    fn used_slots(&self) -> usize {
        let areas: usize = self.registry.areas.iter().map(|(_, a)| a.area.size()).sum();
        // 1Dブロックはエリアに属さない
        let runs: usize = self
            .registry
            .blocks
            .iter()
            .filter(|(_, b)| !b.fmt.is_2d())
            .map(|(_, b)| b.area.size())
            .sum();
        areas + runs
    }

    fn stats(&self) -> TilerStats {
        let reg = &self.registry;
        TilerStats {
            processes: reg.process_count(),
            groups: reg.group_count(),
            areas: reg.area_count(),
            blocks: reg.live_block_count(),
            reserved_blocks: reg.groups.iter().map(|(_, g)| g.reserved.len()).sum(),
            orphans: reg.orphan_count(),
            used_slots: self.used_slots(),
            pool: self.pool.stats(),
            pat: self.pat.stats(),
            ops: self.counters,
        }
    }
}

// ============================================================================
// Placement map
// ============================================================================

/// エリア番号から描画文字
fn area_glyph(index: usize) -> char {
    const GLYPHS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    GLYPHS[index % GLYPHS.len()] as char
}

impl TilerEngine {
    /// 統計のスナップショット
    pub fn stats(&self) -> TilerStats {
        self.lock().stats()
    }

    /// コンテナごとの配置マップとエリア一覧
    ///
    /// グリッドは最大 64x32 文字に縮小して描く。`.` は空き、
    /// 英字はエリア、`=` は1Dブロック。
    pub fn dump_map(&self) -> String {
        let state = self.lock();
        let (width, height) = (state.config.grid_width as usize, state.config.grid_height as usize);
        let sx = width.div_ceil(MAP_COLUMNS);
        let sy = height.div_ceil(MAP_ROWS);
        let (cols, rows) = (width.div_ceil(sx), height.div_ceil(sy));

        let mut out = String::new();
        for container in 0..state.containers.len() {
            let mut cells = alloc::vec![b'.'; cols * rows];
            let mut paint = |x0: u16, y0: u16, x1: u16, y1: u16, glyph: u8| {
                for y in y0 as usize / sy..=y1 as usize / sy {
                    for x in x0 as usize / sx..=x1 as usize / sx {
                        cells[y * cols + x] = glyph;
                    }
                }
            };

            for (i, (_, area)) in state.registry.areas.iter().enumerate() {
                if area.container == container {
                    let a = &area.area;
                    paint(a.p0.x, a.p0.y, a.p1.x, a.p1.y, area_glyph(i) as u8);
                }
            }
            for (_, block) in state.registry.blocks.iter() {
                if block.container != container || block.fmt.is_2d() {
                    continue;
                }
                // ランは行ごとに塗る
                for slice in block.area.slices() {
                    paint(slice.p0.x, slice.p0.y, slice.p1.x, slice.p1.y, b'=');
                }
            }

            let _ = writeln!(
                out,
                "container {} ({}x{} slots, {}x{} per cell)",
                container, width, height, sx, sy
            );
            for row in cells.chunks(cols) {
                out.extend(row.iter().map(|&c| c as char));
                out.push('\n');
            }
        }

        for (i, (_, area)) in state.registry.areas.iter().enumerate() {
            let a = &area.area;
            let owner = match area.group.and_then(|g| state.registry.group(g)) {
                Some(group) => alloc::format!("gid {}", group.gid),
                None => String::from("orphan"),
            };
            let _ = writeln!(
                out,
                "{} container {} ({},{})-({},{}) {} block(s) {}",
                area_glyph(i),
                area.container,
                a.p0.x,
                a.p0.y,
                a.p1.x,
                a.p1.y,
                area.blocks.len(),
                owner
            );
        }
        let stats = state.stats();
        let _ = writeln!(
            out,
            "{} process(es), {} group(s), {} block(s), {} slot(s) used",
            stats.processes, stats.groups, stats.blocks, stats.used_slots
        );
        out
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TilerConfig;
    use crate::engine::AllocRequest;
    use crate::geom::{PAGE_SIZE, TilerFormat};
    use crate::registry::Caller;
    use crate::sim::{SimPageProvider, SimRemapTable};
    use alloc::boxed::Box;

    fn engine() -> TilerEngine {
        TilerEngine::new(
            TilerConfig::default(),
            Box::new(SimPageProvider::new()),
            Box::new(SimRemapTable::new(256, 128)),
        )
        .unwrap()
    }

    #[test]
    fn test_stats_count_slots() {
        let engine = engine();
        let k = Caller::kernel(1);
        engine
            .allocate(k, &AllocRequest::new(TilerFormat::Bit8, 64, 64))
            .unwrap();
        engine
            .allocate(k, &AllocRequest::new(TilerFormat::Page, 3 * PAGE_SIZE, 1))
            .unwrap();

        let stats = engine.stats();
        assert_eq!((stats.processes, stats.groups, stats.areas, stats.blocks), (1, 1, 1, 2));
        // 8bit エリアはバンド幅の64スロット + 3スロットのラン
        assert_eq!(stats.used_slots, 64 + 3);
        assert_eq!(stats.pool.allocated, stats.pool.cached + 2 + 3);
        assert!(stats.pat.refills > 0);
    }

    #[test]
    fn test_dump_map_lists_areas() {
        let engine = engine();
        let k = Caller::kernel(1);
        engine
            .allocate(k, &AllocRequest::new(TilerFormat::Bit8, 64, 64).group(7))
            .unwrap();
        engine
            .allocate(k, &AllocRequest::new(TilerFormat::Page, PAGE_SIZE, 1))
            .unwrap();

        let map = engine.dump_map();
        assert!(map.starts_with("container 0 (256x128 slots, 4x4 per cell)"));
        assert!(map.contains("a container 0 (0,0)-(63,0) 1 block(s) gid 7"));
        assert!(map.contains('='));
        assert!(map.ends_with("1 process(es), 2 group(s), 2 block(s), 65 slot(s) used\n"));
    }
}
