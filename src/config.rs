// ============================================================================
// src/config.rs - エンジン設定
// グリッド寸法、アライメント既定値、ページキャッシュ上限などをまとめる
// ============================================================================

use bitflags::bitflags;

use crate::error::{TilerError, TilerResult};
use crate::geom::{PAGE_SIZE, TilerFormat, VIEW_WINDOW};

/// 既定のグリッド幅（スロット数）
pub const DEFAULT_GRID_WIDTH: u16 = 256;
/// 既定のグリッド高さ（スロット数）
pub const DEFAULT_GRID_HEIGHT: u16 = 128;
/// 最小アライメント粒度（バイト）
pub const DEFAULT_GRANULARITY: usize = 128;
/// 空きページキャッシュの上限（40MiB相当）
pub const DEFAULT_CACHE_LIMIT_PAGES: usize = (40 << 20) / PAGE_SIZE;
/// OSからページを補充する単位
pub const DEFAULT_PAGE_GROWTH: usize = 64;
/// バッファハンドルあたりの最大ブロック数
pub const MAX_BUFFER_BLOCKS: usize = 16;

bitflags! {
    /// フォーマットの集合
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormatSet: u8 {
        /// 8ビット2D
        const BIT8 = 1 << 0;
        /// 16ビット2D
        const BIT16 = 1 << 1;
        /// 32ビット2D
        const BIT32 = 1 << 2;
        /// ページ（1D）
        const PAGE = 1 << 3;

        /// 全2Dフォーマット
        const TWO_D = Self::BIT8.bits() | Self::BIT16.bits() | Self::BIT32.bits();
        /// 全フォーマット
        const ALL = Self::TWO_D.bits() | Self::PAGE.bits();
    }
}

impl FormatSet {
    /// 単一フォーマットを集合に変換
    pub const fn of(fmt: TilerFormat) -> Self {
        match fmt {
            TilerFormat::Bit8 => Self::BIT8,
            TilerFormat::Bit16 => Self::BIT16,
            TilerFormat::Bit32 => Self::BIT32,
            TilerFormat::Page => Self::PAGE,
        }
    }

    /// フォーマットを含むか
    pub fn includes(&self, fmt: TilerFormat) -> bool {
        self.contains(Self::of(fmt))
    }
}

/// タイラーエンジン設定
#[derive(Debug, Clone)]
pub struct TilerConfig {
    /// グリッド幅（スロット）
    pub grid_width: u16,
    /// グリッド高さ（スロット）
    pub grid_height: u16,
    /// 最小アライメント粒度（バイト、2のべき乗）
    pub granularity: usize,
    /// align=0 のときに使うアライメント（バイト、0なら最小粒度）
    pub default_align: usize,
    /// 空きページキャッシュの上限
    pub cache_limit_pages: usize,
    /// OSから一度に補充するページ数
    pub page_growth: usize,
    /// OSから取得するページ数のハードキャップ
    pub max_pages: usize,
    /// バッファハンドルあたりの最大ブロック数
    pub max_buffer_blocks: usize,
    /// PAGE フォーマットを2Dとは別のコンテナに置くか
    pub separate_1d_container: bool,
    /// PATプログラミングをサポートするフォーマット
    pub remap_formats: FormatSet,
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            grid_width: DEFAULT_GRID_WIDTH,
            grid_height: DEFAULT_GRID_HEIGHT,
            granularity: DEFAULT_GRANULARITY,
            default_align: 0,
            cache_limit_pages: DEFAULT_CACHE_LIMIT_PAGES,
            page_growth: DEFAULT_PAGE_GROWTH,
            max_pages: DEFAULT_GRID_WIDTH as usize * DEFAULT_GRID_HEIGHT as usize * 2,
            max_buffer_blocks: MAX_BUFFER_BLOCKS,
            separate_1d_container: false,
            remap_formats: FormatSet::ALL,
        }
    }
}

impl TilerConfig {
    /// グリッドのスロット総数
    pub fn grid_slots(&self) -> usize {
        self.grid_width as usize * self.grid_height as usize
    }

    /// 設定値を検証
    pub fn validate(&self) -> TilerResult<()> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(TilerError::InvalidArgument);
        }
        // 各フォーマットのビューウィンドウに収まる必要がある
        if self.grid_slots() * PAGE_SIZE > VIEW_WINDOW {
            return Err(TilerError::InvalidArgument);
        }
        if !self.granularity.is_power_of_two() || self.granularity > PAGE_SIZE {
            return Err(TilerError::InvalidArgument);
        }
        if self.default_align > PAGE_SIZE {
            return Err(TilerError::InvalidArgument);
        }
        if self.page_growth == 0 || self.max_pages == 0 {
            return Err(TilerError::InvalidArgument);
        }
        if self.max_buffer_blocks == 0 || self.max_buffer_blocks > MAX_BUFFER_BLOCKS {
            return Err(TilerError::InvalidArgument);
        }
        Ok(())
    }

    /// フォーマットが置かれるコンテナ番号
    pub fn container_index(&self, fmt: TilerFormat) -> usize {
        if self.separate_1d_container && fmt == TilerFormat::Page {
            1
        } else {
            0
        }
    }

    /// コンテナ数
    pub fn container_count(&self) -> usize {
        if self.separate_1d_container { 2 } else { 1 }
    }
}
