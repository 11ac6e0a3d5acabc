// ============================================================================
// src/container/grid.rs - ビットマップ方式の既定タイルコンテナ
//
// 2D: 左上からのファーストフィット（x はアライメント境界のみ候補）
// 1D: グリッド末尾から行優先で逆方向に探索
// 2D と 1D を同じグリッドに置いても互いに干渉しにくいよう、
// 1D は下側から埋めていく。
// ============================================================================

use alloc::vec;
use alloc::vec::Vec;

use super::{Point, TileArea, TileContainer};
use crate::error::ContainerError;

/// ビットマップ方式のグリッドコンテナ
///
/// 全体がエンジンのロックで保護されるため、内部はAtomicを使わない。
pub struct GridContainer {
    width: u16,
    height: u16,
    /// 占有ビットマップ（1 = 使用中）、行優先
    bitmap: Vec<u64>,
    /// 使用中スロット数（統計用）
    used: usize,
}

impl GridContainer {
    /// 空のグリッドを作成
    pub fn new(width: u16, height: u16) -> Self {
        let slots = width as usize * height as usize;
        Self {
            width,
            height,
            bitmap: vec![0u64; slots.div_ceil(64)],
            used: 0,
        }
    }

    /// 使用中スロット数
    pub fn used_slots(&self) -> usize {
        self.used
    }

    #[inline]
    fn index(&self, x: u16, y: u16) -> usize {
        y as usize * self.width as usize + x as usize
    }

    #[inline]
    fn is_used(&self, i: usize) -> bool {
        self.bitmap[i / 64] & (1u64 << (i % 64)) != 0
    }

    #[inline]
    fn set(&mut self, i: usize, used: bool) {
        if used {
            self.bitmap[i / 64] |= 1u64 << (i % 64);
        } else {
            self.bitmap[i / 64] &= !(1u64 << (i % 64));
        }
    }

    /// 矩形が全て空きか
    fn rect_free(&self, x0: u16, y0: u16, w: u16, h: u16) -> bool {
        (y0..y0 + h).all(|y| (x0..x0 + w).all(|x| !self.is_used(self.index(x, y))))
    }

    /// 領域の全スロットを設定
    fn mark(&mut self, area: &TileArea, used: bool) {
        for slice in area.slices() {
            for y in slice.p0.y..=slice.p1.y {
                for x in slice.p0.x..=slice.p1.x {
                    let i = self.index(x, y);
                    self.set(i, used);
                }
            }
        }
        let n = area.size();
        if used {
            self.used += n;
        } else {
            self.used -= n;
        }
    }

    /// 領域がこのグリッド内にあるか
    fn in_bounds(&self, area: &TileArea) -> bool {
        area.stride == self.width
            && area.p1.x < self.width
            && area.p1.y < self.height
            && area.p0.x < self.width
            && area.p0.y <= area.p1.y
    }
}

impl TileContainer for GridContainer {
    fn width(&self) -> u16 {
        self.width
    }

    fn height(&self) -> u16 {
        self.height
    }

    fn reserve_2d(
        &mut self,
        width: u16,
        height: u16,
        align: u16,
    ) -> Result<TileArea, ContainerError> {
        if width == 0 || height == 0 || width > self.width || height > self.height {
            return Err(ContainerError::InvalidSize);
        }
        let step = align.max(1) as usize;

        for y in 0..=(self.height - height) {
            let mut x = 0usize;
            while x + width as usize <= self.width as usize {
                if self.rect_free(x as u16, y, width, height) {
                    let area = TileArea::rect(
                        Point::new(x as u16, y),
                        Point::new(x as u16 + width - 1, y + height - 1),
                        self.width,
                    );
                    self.mark(&area, true);
                    return Ok(area);
                }
                x += step;
            }
        }
        Err(ContainerError::NoSpace)
    }

    fn reserve_1d(&mut self, slots: usize) -> Result<TileArea, ContainerError> {
        let total = self.width as usize * self.height as usize;
        if slots == 0 || slots > total {
            return Err(ContainerError::InvalidSize);
        }

        // 末尾から連続した空きを数える
        let mut run = 0usize;
        for i in (0..total).rev() {
            if self.is_used(i) {
                run = 0;
                continue;
            }
            run += 1;
            if run == slots {
                let end = i + slots - 1;
                let w = self.width as usize;
                let area = TileArea::run(
                    Point::new((i % w) as u16, (i / w) as u16),
                    Point::new((end % w) as u16, (end / w) as u16),
                    self.width,
                );
                self.mark(&area, true);
                return Ok(area);
            }
        }
        Err(ContainerError::NoSpace)
    }

    fn free(&mut self, area: &TileArea) -> Result<(), ContainerError> {
        if !self.in_bounds(area) {
            return Err(ContainerError::InvalidSize);
        }
        // 全スロットが使用中でなければ予約されていない
        let reserved = area.slices().all(|s| {
            (s.p0.y..=s.p1.y).all(|y| (s.p0.x..=s.p1.x).all(|x| self.is_used(self.index(x, y))))
        });
        if !reserved {
            return Err(ContainerError::NotReserved);
        }
        self.mark(area, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_2d_first_fit() {
        let mut grid = GridContainer::new(16, 8);
        let a = grid.reserve_2d(4, 2, 4).unwrap();
        let b = grid.reserve_2d(4, 2, 4).unwrap();
        assert_eq!(a.p0, Point::new(0, 0));
        assert_eq!(b.p0, Point::new(4, 0));
        assert!(!a.overlaps(&b));
        assert_eq!(grid.used_slots(), 16);
    }

    #[test]
    fn test_reserve_2d_respects_alignment() {
        let mut grid = GridContainer::new(16, 4);
        grid.reserve_2d(1, 1, 1).unwrap();
        let b = grid.reserve_2d(2, 1, 8).unwrap();
        assert_eq!(b.p0.x % 8, 0);
        assert_eq!(b.p0, Point::new(8, 0));
    }

    #[test]
    fn test_reserve_1d_from_end() {
        let mut grid = GridContainer::new(16, 4);
        let run = grid.reserve_1d(20).unwrap();
        assert!(!run.is_2d);
        assert_eq!(run.p1, Point::new(15, 3));
        assert_eq!(run.p0, Point::new(12, 2));
        assert_eq!(run.size(), 20);

        // 2Dは上から取られるので衝突しない
        let rect = grid.reserve_2d(16, 2, 1).unwrap();
        assert!(!rect.overlaps(&run));
    }

    #[test]
    fn test_free_and_reuse() {
        let mut grid = GridContainer::new(8, 8);
        let a = grid.reserve_2d(8, 8, 1).unwrap();
        assert_eq!(grid.reserve_2d(1, 1, 1), Err(ContainerError::NoSpace));
        grid.free(&a).unwrap();
        assert_eq!(grid.free(&a), Err(ContainerError::NotReserved));
        assert!(grid.reserve_2d(1, 1, 1).is_ok());
    }

    #[test]
    fn test_oversized_request() {
        let mut grid = GridContainer::new(8, 8);
        assert_eq!(grid.reserve_2d(9, 1, 1), Err(ContainerError::InvalidSize));
        assert_eq!(grid.reserve_1d(65), Err(ContainerError::InvalidSize));
    }
}
