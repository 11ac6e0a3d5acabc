// ============================================================================
// src/container/mod.rs - タイルコンテナ (Tile Container)
//
// 有界な2Dグリッド上で矩形領域 (2D) または行優先の連続ラン (1D) を
// 予約/解放する幾何サービス。所有権の概念は持たない。
// エンジンは TileContainer トレイト越しにのみ呼び出す。
// ============================================================================

pub mod grid;

pub use grid::GridContainer;

use crate::error::ContainerError;

/// グリッド上の座標（スロット単位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Point {
    pub x: u16,
    pub y: u16,
}

impl Point {
    pub const fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

/// 予約済み領域
///
/// `p0`/`p1` は両端を含む。1Dの場合は行優先順で `p0` から `p1` までの
/// 全スロットを表し、複数行にまたがりうる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileArea {
    /// 2D矩形か
    pub is_2d: bool,
    /// 開始点
    pub p0: Point,
    /// 終了点（含む）
    pub p1: Point,
    /// 予約元コンテナの幅（1Dのスロット計算に使う）
    pub stride: u16,
}

impl TileArea {
    /// 2D矩形領域を作成
    pub const fn rect(p0: Point, p1: Point, stride: u16) -> Self {
        Self { is_2d: true, p0, p1, stride }
    }

    /// 1Dラン領域を作成
    pub const fn run(p0: Point, p1: Point, stride: u16) -> Self {
        Self { is_2d: false, p0, p1, stride }
    }

    /// 行優先インデックス
    #[inline]
    fn linear(&self, pt: Point) -> usize {
        pt.y as usize * self.stride as usize + pt.x as usize
    }

    /// 2D幅（1Dでは行をまたぐため全幅）
    pub fn width(&self) -> u16 {
        if self.is_2d || self.p0.y == self.p1.y {
            self.p1.x - self.p0.x + 1
        } else {
            self.stride
        }
    }

    /// 2D高さ（1Dは行数）
    pub fn height(&self) -> u16 {
        self.p1.y - self.p0.y + 1
    }

    /// スロット数
    pub fn size(&self) -> usize {
        if self.is_2d {
            self.width() as usize * self.height() as usize
        } else {
            self.linear(self.p1) - self.linear(self.p0) + 1
        }
    }

    /// 座標が領域内にあるか
    pub fn contains(&self, pt: Point) -> bool {
        if self.is_2d {
            pt.x >= self.p0.x && pt.x <= self.p1.x && pt.y >= self.p0.y && pt.y <= self.p1.y
        } else {
            let i = self.linear(pt);
            pt.x < self.stride && i >= self.linear(self.p0) && i <= self.linear(self.p1)
        }
    }

    /// 別の領域と重なるか
    pub fn overlaps(&self, other: &TileArea) -> bool {
        other.slices().any(|s| {
            self.slices().any(|m| {
                m.p0.x <= s.p1.x && s.p0.x <= m.p1.x && m.p0.y <= s.p1.y && s.p0.y <= m.p1.y
            })
        })
    }

    /// 連続した矩形スライスに分割するイテレータ
    pub fn slices(&self) -> Slices {
        Slices { rest: Some(*self) }
    }
}

/// 領域を矩形スライスに分割するイテレータ
///
/// 2D領域はそのまま1スライス。1D領域は「先頭の部分行」「中間の完全な行」
/// 「末尾の部分行」に分割される（行全体から始まり行全体で終わる場合は
/// まとめて1スライス）。
pub struct Slices {
    rest: Option<TileArea>,
}

impl Iterator for Slices {
    type Item = TileArea;

    fn next(&mut self) -> Option<TileArea> {
        let parent = self.rest.as_mut()?;
        let mut slice = *parent;
        let last_col = parent.stride - 1;

        if !parent.is_2d
            && parent.p0.y != parent.p1.y
            && (parent.p0.x != 0 || parent.p1.x != last_col)
        {
            // スライスの終点（始点は変わらない）
            slice.p1.x = last_col;
            slice.p1.y = if parent.p0.x != 0 { parent.p0.y } else { parent.p1.y - 1 };
            // 残りの領域
            parent.p0.x = 0;
            parent.p0.y = slice.p1.y + 1;
        } else {
            self.rest = None;
        }
        // スライス自体は常に矩形
        slice.is_2d = true;
        Some(slice)
    }
}

/// タイルコンテナトレイト
///
/// 予約された領域同士が重ならないことを保証する。
pub trait TileContainer: Send {
    /// グリッド幅
    fn width(&self) -> u16;

    /// グリッド高さ
    fn height(&self) -> u16;

    /// `width` x `height` の矩形を x が `align` の倍数となる位置に予約
    fn reserve_2d(&mut self, width: u16, height: u16, align: u16)
        -> Result<TileArea, ContainerError>;

    /// `slots` 個の連続スロットを予約
    fn reserve_1d(&mut self, slots: usize) -> Result<TileArea, ContainerError>;

    /// 予約を解放
    fn free(&mut self, area: &TileArea) -> Result<(), ContainerError>;

    /// 座標が領域内にあるか
    fn is_in(&self, pt: Point, area: &TileArea) -> bool {
        area.contains(pt)
    }

    /// 領域の幅と高さ
    fn area_dimensions(&self, area: &TileArea) -> (u16, u16) {
        (area.width(), area.height())
    }

    /// 領域をスライス単位で走査
    fn slices(&self, area: &TileArea) -> Slices {
        area.slices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_rect_slices_once() {
        let area = TileArea::rect(Point::new(4, 2), Point::new(9, 5), 256);
        let slices: Vec<_> = area.slices().collect();
        assert_eq!(slices, alloc::vec![area]);
        assert_eq!(area.size(), 24);
    }

    #[test]
    fn test_run_slices_head_body_tail() {
        // (3,1) から (5,4) まで: 部分行 + 完全行2本 + 部分行
        let area = TileArea::run(Point::new(3, 1), Point::new(5, 4), 16);
        let slices: Vec<_> = area.slices().collect();
        assert_eq!(slices.len(), 3);
        assert_eq!((slices[0].p0, slices[0].p1), (Point::new(3, 1), Point::new(15, 1)));
        assert_eq!((slices[1].p0, slices[1].p1), (Point::new(0, 2), Point::new(15, 3)));
        assert_eq!((slices[2].p0, slices[2].p1), (Point::new(0, 4), Point::new(5, 4)));
        let total: usize = slices.iter().map(|s| s.size()).sum();
        assert_eq!(total, area.size());
    }

    #[test]
    fn test_run_contains() {
        let area = TileArea::run(Point::new(14, 0), Point::new(1, 1), 16);
        assert!(area.contains(Point::new(15, 0)));
        assert!(area.contains(Point::new(0, 1)));
        assert!(!area.contains(Point::new(2, 1)));
        assert!(!area.contains(Point::new(13, 0)));
        assert_eq!(area.size(), 4);
    }
}
