// ============================================================================
// Memory Management Module
// 物理ページプールとPAT (リマップテーブル) プログラミング
// ============================================================================
pub mod page_pool;
pub mod pat;

use alloc::vec::Vec;

use crate::error::PoolError;
use crate::registry::Pid;

pub use page_pool::{PagePool, PoolStats};
pub use pat::{PatArea, PatEngine, PatStats, RemapTable};

/// 物理ページ (Newtype)
///
/// PATエントリは32ビット物理アドレスを取るため u32 で保持する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysPage(u32);

impl PhysPage {
    /// 物理アドレスから作成（ページ境界である必要がある）
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// 物理アドレス
    pub const fn addr(&self) -> u32 {
        self.0
    }
}

/// OSのページプリミティブ
///
/// ページの確保/解放と、別プロセスが所有しうる既存バッファの
/// 物理ページ解決を提供する。
pub trait PageProvider: Send {
    /// 物理ページを1枚確保
    fn alloc_page(&mut self) -> Option<PhysPage>;

    /// 物理ページをOSに返却
    fn free_page(&mut self, page: PhysPage);

    /// プロセス `pid` の仮想バッファ `[vaddr, vaddr + len)` を裏付ける
    /// 物理ページを解決し、ピン留めする
    fn resolve_user_pages(
        &mut self,
        pid: Pid,
        vaddr: usize,
        len: usize,
    ) -> Result<Vec<PhysPage>, PoolError>;

    /// `resolve_user_pages` でピン留めしたページを解放
    fn unpin_pages(&mut self, _pages: &[PhysPage]) {}
}
