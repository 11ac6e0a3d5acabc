// ============================================================================
// src/sim.rs - ホスト上で動作するシミュレーション用バックエンド
//
// OSのページプリミティブとPATハードウェアをメモリ上で模擬する。
// どちらも Clone で内部状態を共有するため、エンジンに渡した後も
// テスト側から状態を観察/操作できる。
// ============================================================================

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashSet;
use spin::Mutex;

use crate::error::{PatError, PoolError};
use crate::geom::{PAGE_MASK, PAGE_SIZE};
use crate::mm::{PageProvider, PatArea, PhysPage, RemapTable};
use crate::registry::Pid;

/// 模擬物理メモリの先頭
const SIM_PHYS_BASE: u32 = 0x8000_0000;
/// ユーザーバッファ解決で返すページの先頭
const SIM_USER_BASE: u32 = 0x4000_0000;

struct SimPages {
    next: u32,
    recycled: Vec<PhysPage>,
    live: HashSet<PhysPage>,
    /// 同時に確保できるページ数の上限
    limit: Option<usize>,
    pinned: usize,
    fail_resolve: bool,
}

/// 模擬OSページプロバイダ
#[derive(Clone)]
pub struct SimPageProvider {
    inner: Arc<Mutex<SimPages>>,
}

impl Default for SimPageProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPageProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimPages {
                next: SIM_PHYS_BASE,
                recycled: Vec::new(),
                live: HashSet::new(),
                limit: None,
                pinned: 0,
                fail_resolve: false,
            })),
        }
    }

    /// OSが `limit` ページまでしか渡さないプロバイダ
    pub fn with_limit(limit: usize) -> Self {
        let provider = Self::new();
        provider.set_limit(Some(limit));
        provider
    }

    pub fn set_limit(&self, limit: Option<usize>) {
        self.inner.lock().limit = limit;
    }

    /// ユーザーバッファの解決を失敗させる
    pub fn set_fail_resolve(&self, fail: bool) {
        self.inner.lock().fail_resolve = fail;
    }

    /// OSから借りたままのページ数
    pub fn live_pages(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// ピン留め中のユーザーページ数
    pub fn pinned_pages(&self) -> usize {
        self.inner.lock().pinned
    }
}

impl PageProvider for SimPageProvider {
    fn alloc_page(&mut self) -> Option<PhysPage> {
        let mut sim = self.inner.lock();
        if sim.limit.is_some_and(|limit| sim.live.len() >= limit) {
            return None;
        }
        let page = match sim.recycled.pop() {
            Some(page) => page,
            None => {
                let page = PhysPage::new(sim.next);
                sim.next = sim.next.checked_add(PAGE_SIZE as u32)?;
                page
            }
        };
        sim.live.insert(page);
        Some(page)
    }

    fn free_page(&mut self, page: PhysPage) {
        let mut sim = self.inner.lock();
        if sim.live.remove(&page) {
            sim.recycled.push(page);
        } else {
            log::error!("[SIM] double free of page {:#x}", page.addr());
        }
    }

    fn resolve_user_pages(
        &mut self,
        pid: Pid,
        vaddr: usize,
        len: usize,
    ) -> Result<Vec<PhysPage>, PoolError> {
        let mut sim = self.inner.lock();
        if sim.fail_resolve || len == 0 {
            return Err(PoolError::ResolveFailed);
        }
        // プロセスとアドレスから決まる擬似的な物理ページ
        let first = (vaddr & !PAGE_MASK) as u32 ^ (pid << 20);
        let count = (len + (vaddr & PAGE_MASK)).div_ceil(PAGE_SIZE);
        let pages = (0..count as u32)
            .map(|i| PhysPage::new(SIM_USER_BASE | (first.wrapping_add(i * PAGE_SIZE as u32) & 0x3fff_f000)))
            .collect();
        sim.pinned += count;
        Ok(pages)
    }

    fn unpin_pages(&mut self, pages: &[PhysPage]) {
        let mut sim = self.inner.lock();
        sim.pinned = sim.pinned.saturating_sub(pages.len());
    }
}

struct SimTable {
    width: u16,
    height: u16,
    entries: Vec<Option<u32>>,
    refills: usize,
    /// 残り何回成功したら1度失敗するか
    fail_after: Option<usize>,
}

/// 模擬PATハードウェア
#[derive(Clone)]
pub struct SimRemapTable {
    inner: Arc<Mutex<SimTable>>,
}

impl SimRemapTable {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimTable {
                width,
                height,
                entries: vec![None; width as usize * height as usize],
                refills: 0,
                fail_after: None,
            })),
        }
    }

    /// `n` 回成功した後のリフィルを1度だけ失敗させる
    pub fn fail_after(&self, n: usize) {
        self.inner.lock().fail_after = Some(n);
    }

    /// スロットに書かれている物理アドレス
    pub fn entry(&self, x: u16, y: u16) -> Option<u32> {
        let table = self.inner.lock();
        if x >= table.width || y >= table.height {
            return None;
        }
        table.entries[y as usize * table.width as usize + x as usize]
    }

    pub fn refills(&self) -> usize {
        self.inner.lock().refills
    }
}

impl RemapTable for SimRemapTable {
    fn refill(&mut self, area: PatArea, entries: &[u32]) -> Result<(), PatError> {
        let mut table = self.inner.lock();
        match table.fail_after {
            Some(0) => {
                table.fail_after = None;
                return Err(PatError::RefillFailed);
            }
            Some(n) => table.fail_after = Some(n - 1),
            None => {}
        }
        if area.x1 >= table.width
            || area.y1 >= table.height
            || area.x0 > area.x1
            || area.y0 > area.y1
            || entries.len() != area.entries()
        {
            return Err(PatError::RefillFailed);
        }

        let width = table.width as usize;
        let mut src = entries.iter();
        for y in area.y0..=area.y1 {
            for x in area.x0..=area.x1 {
                table.entries[y as usize * width + x as usize] = src.next().copied();
            }
        }
        table.refills += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_limit_and_recycle() {
        let mut provider = SimPageProvider::with_limit(2);
        let a = provider.alloc_page().unwrap();
        let _b = provider.alloc_page().unwrap();
        assert!(provider.alloc_page().is_none());

        provider.free_page(a);
        assert_eq!(provider.alloc_page(), Some(a));
        assert_eq!(provider.live_pages(), 2);
    }

    #[test]
    fn test_resolve_user_pages_counts_partial_pages() {
        let mut provider = SimPageProvider::new();
        let pages = provider.resolve_user_pages(3, 0x1000_0800, PAGE_SIZE).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(provider.pinned_pages(), 2);
        provider.unpin_pages(&pages);
        assert_eq!(provider.pinned_pages(), 0);

        provider.set_fail_resolve(true);
        assert_eq!(
            provider.resolve_user_pages(3, 0x1000_0000, PAGE_SIZE),
            Err(PoolError::ResolveFailed)
        );
    }

    #[test]
    fn test_table_rejects_out_of_bounds() {
        let mut table = SimRemapTable::new(4, 4);
        let area = PatArea {
            x0: 3,
            y0: 0,
            x1: 4,
            y1: 0,
        };
        assert_eq!(table.refill(area, &[0, 0]), Err(PatError::RefillFailed));
        assert_eq!(table.refills(), 0);
    }
}
