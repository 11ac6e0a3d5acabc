// ============================================================================
// src/geom.rs - フォーマット別スロット形状とシステムアドレス変換
//
// 1スロット = 1物理ページ (4KiB)。2Dフォーマットではスロットの
// ピクセル寸法がbppによって変わる:
//   8bit : 64 x 64 px
//   16bit: 64 x 32 px
//   32bit: 32 x 32 px
// システムアドレスはフォーマットごとのビューウィンドウ (128MiB) 内で
// グリッド座標をエンコードしたもの。
// ============================================================================

use core::fmt;

use crate::container::Point;

/// ページシフト
pub const PAGE_SHIFT: usize = 12;
/// ページサイズ
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// ページ内オフセットのマスク
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// エイリアス空間の先頭
pub const ALIAS_BASE: u32 = 0x6000_0000;
/// ビュー選択ビットの位置
pub const VIEW_SHIFT: u32 = 27;
/// 1ビューの大きさ
pub const VIEW_WINDOW: usize = 1 << VIEW_SHIFT;

/// 汎用の切り上げ（2のべき乗でなくてもよい）
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// ピクセルフォーマット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TilerFormat {
    /// 8ビット/ピクセル 2D
    Bit8 = 0,
    /// 16ビット/ピクセル 2D
    Bit16 = 1,
    /// 32ビット/ピクセル 2D
    Bit32 = 2,
    /// ページ単位の1D
    Page = 3,
}

impl TilerFormat {
    /// 全フォーマット
    pub const ALL: [TilerFormat; 4] = [
        TilerFormat::Bit8,
        TilerFormat::Bit16,
        TilerFormat::Bit32,
        TilerFormat::Page,
    ];

    /// 生の値から変換
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(TilerFormat::Bit8),
            1 => Some(TilerFormat::Bit16),
            2 => Some(TilerFormat::Bit32),
            3 => Some(TilerFormat::Page),
            _ => None,
        }
    }

    /// 生の値
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// 2Dフォーマットか
    pub const fn is_2d(self) -> bool {
        !matches!(self, TilerFormat::Page)
    }

    /// 1ピクセルあたりのバイト数
    pub const fn bpp(self) -> usize {
        match self {
            TilerFormat::Bit8 | TilerFormat::Page => 1,
            TilerFormat::Bit16 => 2,
            TilerFormat::Bit32 => 4,
        }
    }

    /// スロット幅（2Dはピクセル、PAGEはバイト）
    pub const fn slot_width(self) -> usize {
        match self {
            TilerFormat::Bit8 | TilerFormat::Bit16 => 64,
            TilerFormat::Bit32 => 32,
            TilerFormat::Page => PAGE_SIZE,
        }
    }

    /// スロット高さ（ライン数）
    pub const fn slot_height(self) -> usize {
        match self {
            TilerFormat::Bit8 => 64,
            TilerFormat::Bit16 | TilerFormat::Bit32 => 32,
            TilerFormat::Page => 1,
        }
    }

    /// スロット1行のバイト数
    pub const fn slot_row_bytes(self) -> usize {
        self.slot_width() * self.bpp()
    }

    /// 1物理ページ経由で到達できるスロット数
    pub const fn band(self) -> usize {
        PAGE_SIZE / self.slot_row_bytes()
    }

    /// このフォーマットのビューの先頭アドレス
    pub const fn view_base(self) -> u32 {
        ALIAS_BASE | ((self as u32) << VIEW_SHIFT)
    }
}

impl fmt::Display for TilerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TilerFormat::Bit8 => write!(f, "8bit"),
            TilerFormat::Bit16 => write!(f, "16bit"),
            TilerFormat::Bit32 => write!(f, "32bit"),
            TilerFormat::Page => write!(f, "page"),
        }
    }
}

/// システムアドレス (Newtype)
///
/// フォーマットタグとグリッド座標をエンコードしたエイリアスアドレス。
/// 呼び出し側はこのアドレスでメモリを参照する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SysAddr(u32);

impl SysAddr {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// エイリアス空間内のアドレスか
    pub const fn is_tiler(&self) -> bool {
        self.0 >= ALIAS_BASE && (self.0 - ALIAS_BASE) < (VIEW_WINDOW as u32) * 4
    }

    /// エンコードされたフォーマット
    pub const fn format(&self) -> Option<TilerFormat> {
        if !self.is_tiler() {
            return None;
        }
        TilerFormat::from_raw((self.0 - ALIAS_BASE) >> VIEW_SHIFT)
    }

    /// ビュー内オフセット
    pub const fn view_offset(&self) -> usize {
        (self.0 as usize) & (VIEW_WINDOW - 1)
    }

    /// バイトオフセットを加算
    pub const fn add(&self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes as u32))
    }

    /// ページ境界に切り下げ
    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(PAGE_MASK as u32))
    }

    /// ページ内オフセット
    pub const fn page_offset(&self) -> usize {
        (self.0 as usize) & PAGE_MASK
    }
}

impl fmt::Display for SysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// グリッド形状とアドレス変換
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    width: u16,
    height: u16,
}

impl Geometry {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    pub const fn width(&self) -> u16 {
        self.width
    }

    pub const fn height(&self) -> u16 {
        self.height
    }

    /// ビュー上の1ラインのバイト数
    pub const fn stride(&self, fmt: TilerFormat) -> usize {
        match fmt {
            TilerFormat::Page => self.width as usize * PAGE_SIZE,
            _ => self.width as usize * fmt.slot_row_bytes(),
        }
    }

    /// 要求サイズがグリッド全体に収まりうるか
    ///
    /// 2D はピクセル単位、ページモードは `width * height` バイト。
    pub const fn fits(&self, fmt: TilerFormat, width: usize, height: usize) -> bool {
        let (w, h) = (self.width as usize, self.height as usize);
        match fmt {
            TilerFormat::Page => match width.checked_mul(height) {
                Some(len) => len <= w * h * PAGE_SIZE,
                None => false,
            },
            _ => width <= w * fmt.slot_width() && height <= h * fmt.slot_height(),
        }
    }

    /// グリッド座標からシステムアドレスを求める
    pub fn addr_of(&self, fmt: TilerFormat, pt: Point) -> SysAddr {
        let offset = match fmt {
            TilerFormat::Page => {
                (pt.y as usize * self.width as usize + pt.x as usize) * PAGE_SIZE
            }
            _ => {
                pt.y as usize * fmt.slot_height() * self.stride(fmt)
                    + pt.x as usize * fmt.slot_row_bytes()
            }
        };
        SysAddr(fmt.view_base() + offset as u32)
    }

    /// システムアドレスをフォーマットとグリッド座標に分解
    ///
    /// グリッド外を指すアドレスは `None`。
    pub fn decode(&self, addr: SysAddr) -> Option<(TilerFormat, Point)> {
        let fmt = addr.format()?;
        let offset = addr.view_offset();
        let (x, y) = match fmt {
            TilerFormat::Page => {
                let index = offset / PAGE_SIZE;
                (index % self.width as usize, index / self.width as usize)
            }
            _ => {
                let stride = self.stride(fmt);
                let y_px = offset / stride;
                let x_bytes = offset % stride;
                (x_bytes / fmt.slot_row_bytes(), y_px / fmt.slot_height())
            }
        };
        if y >= self.height as usize || x >= self.width as usize {
            return None;
        }
        Some((fmt, Point::new(x as u16, y as u16)))
    }

    /// ページ境界に揃えた仮想ストライド
    pub const fn vstride(fmt: TilerFormat, width_slots: usize) -> usize {
        align_up(width_slots * fmt.slot_row_bytes(), PAGE_SIZE)
    }
}
