// ============================================================================
// src/mm/page_pool.rs - 物理ページプール
//
// 解放されたページをスタックにキャッシュし、空になったらOSから
// 一定数ずつ補充する。OSから取得したページ数はハードキャップで制限。
// メモリ逼迫時はキャッシュせずOSへ直接返却し、purge で全キャッシュを返す。
//
// 注意: 構造体全体がエンジンのMutexで保護されるため、
// 内部フィールドは通常の usize を使用。
// ============================================================================

use alloc::vec::Vec;

use super::{PageProvider, PhysPage};
use crate::error::PoolError;

/// ページプール統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// OSから取得済みのページ数（使用中 + キャッシュ）
    pub allocated: usize,
    /// キャッシュ中の空きページ数
    pub cached: usize,
    /// 累計の取得要求ページ数
    pub total_acquired: u64,
    /// 累計のOS返却ページ数
    pub total_returned: u64,
}

/// 物理ページプール
pub struct PagePool {
    /// 空きページスタック
    free: Vec<PhysPage>,
    /// OSから取得済みのページ数
    allocated: usize,
    /// キャッシュ上限
    cache_limit: usize,
    /// 補充単位
    growth: usize,
    /// ハードキャップ
    max_pages: usize,
    total_acquired: u64,
    total_returned: u64,
}

impl PagePool {
    /// 新しいプールを作成（ページは保持しない）
    pub const fn new(cache_limit: usize, growth: usize, max_pages: usize) -> Self {
        Self {
            free: Vec::new(),
            allocated: 0,
            cache_limit,
            growth,
            max_pages,
            total_acquired: 0,
            total_returned: 0,
        }
    }

    /// OSから最大 `growth` ページを補充
    ///
    /// 補充できたページ数を返す。
    fn refill(&mut self, provider: &mut dyn PageProvider) -> usize {
        let room = self.max_pages.saturating_sub(self.allocated);
        let want = self.growth.min(room);
        let mut got = 0;
        while got < want {
            match provider.alloc_page() {
                Some(page) => {
                    self.free.push(page);
                    self.allocated += 1;
                    got += 1;
                }
                None => break,
            }
        }
        if got > 0 {
            log::debug!("[POOL] refilled {} pages ({} allocated)", got, self.allocated);
        }
        got
    }

    /// `n` ページを取得
    ///
    /// 途中で枯渇した場合は取得済みページをスタックに戻して失敗する。
    pub fn acquire(
        &mut self,
        provider: &mut dyn PageProvider,
        n: usize,
    ) -> Result<Vec<PhysPage>, PoolError> {
        let mut pages = Vec::new();
        pages.try_reserve(n).map_err(|_| PoolError::Exhausted)?;

        while pages.len() < n {
            if self.free.is_empty() && self.refill(provider) == 0 {
                log::warn!(
                    "[POOL] exhausted: wanted {} pages, {} allocated (cap {})",
                    n,
                    self.allocated,
                    self.max_pages
                );
                // 取得済みページはキャッシュへ戻す
                self.free.extend(pages.drain(..));
                return Err(PoolError::Exhausted);
            }
            if let Some(page) = self.free.pop() {
                pages.push(page);
            }
        }
        self.total_acquired += n as u64;
        Ok(pages)
    }

    /// ページを返却
    ///
    /// `pressure` が立っている場合、キャッシュ上限に達している場合、
    /// またはキャップを超えている場合はOSへ直接返却する。
    pub fn release(&mut self, provider: &mut dyn PageProvider, pages: Vec<PhysPage>, pressure: bool) {
        for page in pages {
            if pressure || self.free.len() >= self.cache_limit || self.allocated > self.max_pages {
                provider.free_page(page);
                self.allocated -= 1;
                self.total_returned += 1;
            } else {
                self.free.push(page);
            }
        }
    }

    /// キャッシュ中の全ページをOSへ返却
    ///
    /// 使用中のページには触れない。返却したページ数を返す。
    pub fn purge(&mut self, provider: &mut dyn PageProvider) -> usize {
        let count = self.free.len();
        for page in self.free.drain(..) {
            provider.free_page(page);
        }
        self.allocated -= count;
        self.total_returned += count as u64;
        if count > 0 {
            log::info!("[POOL] purged {} cached pages", count);
        }
        count
    }

    /// キャッシュ中のページ数
    pub fn cached(&self) -> usize {
        self.free.len()
    }

    /// 使用中のページ数
    pub fn in_use(&self) -> usize {
        self.allocated - self.free.len()
    }

    /// 統計情報を取得
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated,
            cached: self.free.len(),
            total_acquired: self.total_acquired,
            total_returned: self.total_returned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPageProvider;

    #[test]
    fn test_acquire_refills_in_growth_steps() {
        let mut provider = SimPageProvider::new();
        let mut pool = PagePool::new(128, 16, 1024);

        let pages = pool.acquire(&mut provider, 5).unwrap();
        assert_eq!(pages.len(), 5);
        assert_eq!(pool.stats().allocated, 16);
        assert_eq!(pool.cached(), 11);
        assert_eq!(provider.live_pages(), 16);
    }

    #[test]
    fn test_cap_is_enforced_and_rolled_back() {
        let mut provider = SimPageProvider::new();
        let mut pool = PagePool::new(128, 4, 10);

        assert_eq!(pool.acquire(&mut provider, 11), Err(PoolError::Exhausted));
        // ロールバックされてキャッシュに戻る
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.cached(), 10);

        let pages = pool.acquire(&mut provider, 10).unwrap();
        assert_eq!(pages.len(), 10);
    }

    #[test]
    fn test_release_caches_up_to_limit() {
        let mut provider = SimPageProvider::new();
        let mut pool = PagePool::new(2, 8, 64);

        let pages = pool.acquire(&mut provider, 8).unwrap();
        pool.release(&mut provider, pages, false);
        assert_eq!(pool.cached(), 2);
        assert_eq!(pool.stats().allocated, 2);
        assert_eq!(provider.live_pages(), 2);
    }

    #[test]
    fn test_release_under_pressure_and_purge() {
        let mut provider = SimPageProvider::new();
        let mut pool = PagePool::new(64, 8, 64);

        let pages = pool.acquire(&mut provider, 4).unwrap();
        pool.release(&mut provider, pages, true);
        // 4枚はOSへ、補充分の残り4枚はキャッシュ
        assert_eq!(pool.cached(), 4);
        assert_eq!(provider.live_pages(), 4);

        assert_eq!(pool.purge(&mut provider), 4);
        assert_eq!(provider.live_pages(), 0);
        assert_eq!(pool.stats().allocated, 0);
    }
}
