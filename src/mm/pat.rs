// ============================================================================
// src/mm/pat.rs - PAT (Physical Address Translator) プログラミング
//
// 領域をコンテナ定義のスライス（矩形）に分割し、スライスごとに
// 物理ページアドレスをステージングバッファへコピーしてリフィルを発行する。
// どこかのスライスで失敗した場合は、それまでに書き込んだスライスを
// ダミーページで上書きしてから失敗を返す（部分的な状態は残さない）。
// ============================================================================

use alloc::vec::Vec;

use super::PhysPage;
use crate::container::TileArea;
use crate::error::PatError;

/// リフィル対象の矩形（スロット座標、両端を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatArea {
    pub x0: u16,
    pub y0: u16,
    pub x1: u16,
    pub y1: u16,
}

impl PatArea {
    /// エントリ数
    pub fn entries(&self) -> usize {
        (self.x1 - self.x0 + 1) as usize * (self.y1 - self.y0 + 1) as usize
    }
}

impl From<&TileArea> for PatArea {
    fn from(slice: &TileArea) -> Self {
        Self {
            x0: slice.p0.x,
            y0: slice.p0.y,
            x1: slice.p1.x,
            y1: slice.p1.y,
        }
    }
}

/// リマップテーブル（ハードウェア）
///
/// `entries` は矩形内を行優先に並べた物理アドレス列。
pub trait RemapTable: Send {
    fn refill(&mut self, area: PatArea, entries: &[u32]) -> Result<(), PatError>;
}

/// PAT統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatStats {
    /// 発行したリフィル数
    pub refills: u64,
    /// 書き込んだエントリ数
    pub entries_written: u64,
    /// リフィル失敗数
    pub failures: u64,
    /// 巻き戻しに失敗したスライス数
    pub rollback_failures: u64,
}

/// PATエンジン
pub struct PatEngine {
    /// ハードウェアに渡すステージングバッファ
    staging: Vec<u32>,
    /// クリア時に全エントリへ書くスクラッチページ
    dummy: Option<PhysPage>,
    stats: PatStats,
}

impl PatEngine {
    /// ステージングバッファを `width * height` エントリ分確保して作成
    pub fn new(width: u16, height: u16, dummy: Option<PhysPage>) -> Self {
        Self {
            staging: Vec::with_capacity(width as usize * height as usize),
            dummy,
            stats: PatStats::default(),
        }
    }

    /// ダミーページ
    pub fn dummy_page(&self) -> Option<PhysPage> {
        self.dummy
    }

    /// ダミーページを取り外す（エンジン破棄時にOSへ返すため）
    pub fn take_dummy_page(&mut self) -> Option<PhysPage> {
        self.dummy.take()
    }

    /// 統計情報
    pub fn stats(&self) -> PatStats {
        self.stats
    }

    /// 1スライス分をステージングしてリフィル
    fn refill_slice(
        &mut self,
        remap: &mut dyn RemapTable,
        slice: &TileArea,
        fill: impl Iterator<Item = u32>,
    ) -> Result<(), PatError> {
        self.staging.clear();
        self.staging.extend(fill);

        let area = PatArea::from(slice);
        #[cfg(feature = "verbose_logging")]
        log::trace!(
            "[PAT] refill ({},{})-({},{}) {} entries",
            area.x0,
            area.y0,
            area.x1,
            area.y1,
            self.staging.len()
        );

        self.stats.refills += 1;
        match remap.refill(area, &self.staging) {
            Ok(()) => {
                self.stats.entries_written += self.staging.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.failures += 1;
                Err(e)
            }
        }
    }

    /// 領域にページ列をプログラム
    ///
    /// `pages` は領域のスロットを行優先（1Dはラン順）に並べたもの。
    pub fn program(
        &mut self,
        remap: &mut dyn RemapTable,
        area: &TileArea,
        pages: &[PhysPage],
    ) -> Result<(), PatError> {
        if pages.len() < area.size() {
            return Err(PatError::ShortPageList);
        }

        let mut done = 0usize;
        let mut programmed: Vec<TileArea> = Vec::new();
        for slice in area.slices() {
            let n = slice.size();
            let chunk = &pages[done..done + n];
            if let Err(e) = self.refill_slice(remap, &slice, chunk.iter().map(|p| p.addr())) {
                log::error!(
                    "[PAT] refill failed at ({},{}): {}",
                    slice.p0.x,
                    slice.p0.y,
                    e
                );
                // 書き込み済みスライスを巻き戻す
                for prev in &programmed {
                    if let Err(e) = self.clear_slice(remap, prev) {
                        log::warn!(
                            "[PAT] rollback failed at ({},{}): {}",
                            prev.p0.x,
                            prev.p0.y,
                            e
                        );
                        self.stats.rollback_failures += 1;
                    }
                }
                return Err(PatError::RefillFailed);
            }
            programmed.push(slice);
            done += n;
        }
        Ok(())
    }

    fn clear_slice(&mut self, remap: &mut dyn RemapTable, slice: &TileArea) -> Result<(), PatError> {
        let dummy = self.dummy.ok_or(PatError::NoDummyPage)?;
        let n = slice.size();
        self.refill_slice(remap, slice, core::iter::repeat_n(dummy.addr(), n))
    }

    /// 領域の全エントリをダミーページに向ける
    pub fn clear(&mut self, remap: &mut dyn RemapTable, area: &TileArea) -> Result<(), PatError> {
        let mut result = Ok(());
        for slice in area.slices() {
            // 失敗しても残りのスライスはクリアを続ける
            if let Err(e) = self.clear_slice(remap, &slice) {
                log::warn!("[PAT] clear failed at ({},{}): {}", slice.p0.x, slice.p0.y, e);
                result = Err(e);
            }
        }
        result
    }
}
