// ============================================================================
// src/engine/mod.rs - タイラーエンジン
//
// レジストリ、タイルコンテナ、ページプール、PATステージング、
// OSプロバイダ、通知バスを1つの spin::Mutex で保護する。
// 全ての変更操作はロックを保持したまま完了する（OSからのページ取得も含む）。
// メモリ逼迫フラグだけはロックなしで読める AtomicBool。
//
// ブロックの破棄は destroy_block の1箇所に集約されている:
//   PATクリア → ページ返却 → エリア/グループから切り離し
//   → 空になったエリアのコンテナ予約を解放 → グループ解放 → プロセス解放
// free / バッファ解除 / プロセス破棄はすべてこの経路を通る。
// ============================================================================

pub mod buffer;
pub mod placement;
pub mod reserve;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

pub use buffer::{MapSegment, ProcessMapping};
pub use placement::AllocRequest;
pub use reserve::ReserveShape;

use crate::config::TilerConfig;
use crate::container::{GridContainer, TileContainer};
use crate::error::{TilerError, TilerResult};
use crate::geom::{Geometry, SysAddr, TilerFormat};
use crate::mm::{PageProvider, PagePool, PatEngine, RemapTable};
use crate::notify::{EventKinds, NotificationBus, NotifierFn, TilerEvent};
use crate::registry::{BlockId, BlockPages, Caller, Detached, Pid, ProcessId, Registry};

/// 操作カウンタ（`stats` フィーチャ有効時のみ加算される）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounters {
    pub allocations: u64,
    pub alloc_failures: u64,
    pub frees: u64,
    pub blocks_destroyed: u64,
    pub buffers_registered: u64,
    pub processes_torn_down: u64,
}

#[inline]
pub(crate) fn bump(counter: &mut u64) {
    #[cfg(feature = "stats")]
    {
        *counter += 1;
    }
    #[cfg(not(feature = "stats"))]
    let _ = counter;
}

/// ロックで保護されるエンジン状態
pub(crate) struct EngineState {
    pub(crate) config: TilerConfig,
    pub(crate) geom: Geometry,
    pub(crate) containers: Vec<Box<dyn TileContainer>>,
    pub(crate) registry: Registry,
    pub(crate) pool: PagePool,
    pub(crate) pat: PatEngine,
    pub(crate) provider: Box<dyn PageProvider>,
    pub(crate) remap: Box<dyn RemapTable>,
    pub(crate) bus: NotificationBus,
    pub(crate) counters: OpCounters,
    /// ロック取得時に AtomicBool から写したメモリ逼迫フラグ
    pub(crate) pressure: bool,
}

impl EngineState {
    /// このフォーマットのコンテナがPATプログラミングに対応しているか
    pub(crate) fn can_remap(&self, fmt: TilerFormat) -> bool {
        self.config.remap_formats.includes(fmt)
    }

    /// アドレスを含む生存中のブロックを探す
    pub(crate) fn lookup(&self, addr: SysAddr) -> TilerResult<BlockId> {
        let (fmt, pt) = self.geom.decode(addr).ok_or(TilerError::NotFound)?;
        self.registry
            .find_block(self.config.container_index(fmt), pt)
            .ok_or(TilerError::NotFound)
    }

    /// 裏付けページを出所に応じて返す
    pub(crate) fn release_backing(&mut self, pages: BlockPages) {
        match pages {
            BlockPages::Pool(pages) => {
                self.pool.release(&mut *self.provider, pages, self.pressure)
            }
            BlockPages::Pinned(pages) => self.provider.unpin_pages(&pages),
            BlockPages::Caller(_) => {}
        }
    }

    /// ブロックを破棄し、解放カスケードを実行
    pub(crate) fn destroy_block(&mut self, id: BlockId) {
        let Some(Detached {
            block,
            reservation,
            group,
        }) = self.registry.detach_block(id)
        else {
            return;
        };

        if let Some(pages) = block.pages {
            if let Err(e) = self.pat.clear(&mut *self.remap, &block.area) {
                log::warn!("[TILER] clearing {} failed: {}", block.addr, e);
            }
            self.release_backing(pages);
        }
        if let Some((index, area)) = reservation {
            if let Some(container) = self.containers.get_mut(index) {
                if let Err(e) = container.free(&area) {
                    log::error!("[TILER] container {} free failed: {}", index, e);
                }
            }
        }
        if let Some(group) = group {
            self.registry.try_release_group(group);
        }
        bump(&mut self.counters.blocks_destroyed);
    }

    /// 作成者の保持を解除し、参照がなければ破棄
    ///
    /// 破棄された場合 true。
    pub(crate) fn try_free(&mut self, id: BlockId) -> TilerResult<bool> {
        let block = self
            .registry
            .blocks
            .get_mut(id)
            .ok_or(TilerError::NotFound)?;
        if block.alloced {
            block.alloced = false;
            block.release()?;
        }
        if block.is_dead() {
            self.destroy_block(id);
            return Ok(true);
        }
        Ok(false)
    }

    /// 参照を1つ解放し、破棄条件を満たせば破棄
    pub(crate) fn release_ref(&mut self, id: BlockId) -> TilerResult<()> {
        let block = self
            .registry
            .blocks
            .get_mut(id)
            .ok_or(TilerError::NotFound)?;
        block.release()?;
        if block.is_dead() {
            self.destroy_block(id);
        }
        Ok(())
    }

    /// プロセスを破棄（失敗しない）
    ///
    /// 他プロセスのバッファハンドルから参照されているエリア/1Dブロックは
    /// 孤児リストへ移し、最後の参照が解放されたときに破棄される。
    pub(crate) fn teardown_process(&mut self, process: ProcessId) {
        let Some(info) = self.registry.processes.get_mut(process) else {
            return;
        };
        info.closing = true;
        let pid = info.pid;
        let buffers = core::mem::take(&mut info.buffers);
        let groups = info.groups.clone();

        if !buffers.is_empty() {
            self.bus.notify(TilerEvent::ProcessClose { pid });
        }
        for handle in buffers {
            for block in handle.blocks {
                if let Err(e) = self.release_ref(block) {
                    log::warn!("[TILER] pid {}: releasing buffer block: {}", pid, e);
                }
            }
        }

        for group in groups {
            // 予約のみのブロックを先に返す
            let reserved = match self.registry.groups.get_mut(group) {
                Some(info) => core::mem::take(&mut info.reserved),
                None => continue,
            };
            for block in reserved {
                self.destroy_block(block);
            }

            let areas = match self.registry.groups.get(group) {
                Some(info) => info.areas.clone(),
                None => continue,
            };
            for area in areas {
                let members = match self.registry.areas.get(area) {
                    Some(info) => info.blocks.clone(),
                    None => continue,
                };
                for block in members {
                    let _ = self.try_free(block);
                }
                if self.registry.areas.contains(area) {
                    log::debug!("[TILER] pid {}: orphaning area {:?}", pid, area);
                    self.registry.orphan_area(area);
                }
            }

            let onedim = match self.registry.groups.get(group) {
                Some(info) => info.onedim.clone(),
                None => continue,
            };
            for block in onedim {
                let _ = self.try_free(block);
                if self.registry.blocks.contains(block) {
                    log::debug!("[TILER] pid {}: orphaning block {:?}", pid, block);
                    self.registry.orphan_block(block);
                }
            }

            // この時点でグループは空
            if let Some(info) = self.registry.groups.remove(group) {
                debug_assert!(info.is_empty());
            }
        }

        self.registry.remove_process(process);
        bump(&mut self.counters.processes_torn_down);
        log::info!("[TILER] pid {} torn down", pid);
    }
}

/// タイラーエンジン
pub struct TilerEngine {
    state: Mutex<EngineState>,
    pressure: AtomicBool,
    geom: Geometry,
}

impl TilerEngine {
    /// 既定のグリッドコンテナでエンジンを作成
    pub fn new(
        config: TilerConfig,
        provider: Box<dyn PageProvider>,
        remap: Box<dyn RemapTable>,
    ) -> TilerResult<Self> {
        let containers = (0..config.container_count())
            .map(|_| {
                Box::new(GridContainer::new(config.grid_width, config.grid_height))
                    as Box<dyn TileContainer>
            })
            .collect();
        Self::with_containers(config, containers, provider, remap)
    }

    /// 任意のタイルコンテナでエンジンを作成
    ///
    /// ダミーページはここでOSから直接取得する。
    pub fn with_containers(
        config: TilerConfig,
        containers: Vec<Box<dyn TileContainer>>,
        mut provider: Box<dyn PageProvider>,
        remap: Box<dyn RemapTable>,
    ) -> TilerResult<Self> {
        config.validate()?;
        if containers.len() != config.container_count()
            || containers
                .iter()
                .any(|c| c.width() != config.grid_width || c.height() != config.grid_height)
        {
            return Err(TilerError::InvalidArgument);
        }

        let dummy = provider.alloc_page().ok_or(TilerError::OutOfMemory)?;
        let geom = Geometry::new(config.grid_width, config.grid_height);
        log::info!(
            "[TILER] init: grid {}x{}, {} container(s), dummy page {:#x}",
            config.grid_width,
            config.grid_height,
            containers.len(),
            dummy.addr()
        );

        let state = EngineState {
            pool: PagePool::new(config.cache_limit_pages, config.page_growth, config.max_pages),
            pat: PatEngine::new(config.grid_width, config.grid_height, Some(dummy)),
            config,
            geom,
            containers,
            registry: Registry::new(),
            provider,
            remap,
            bus: NotificationBus::new(),
            counters: OpCounters::default(),
            pressure: false,
        };
        Ok(Self {
            state: Mutex::new(state),
            pressure: AtomicBool::new(false),
            geom,
        })
    }

    /// 状態をロック
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        let mut state = self.state.lock();
        state.pressure = self.pressure.load(Ordering::Acquire);
        state
    }

    /// グリッド形状
    pub fn geometry(&self) -> Geometry {
        self.geom
    }

    /// 設定のコピー
    pub fn config(&self) -> TilerConfig {
        self.lock().config.clone()
    }

    // ========================================
    // プロセスの寿命
    // ========================================

    /// ハンドル追跡プロセスのオープン
    pub fn open(&self, pid: Pid) -> TilerResult<()> {
        let mut state = self.lock();
        let process = state.registry.get_or_create_process(Caller::handle(pid));
        if let Some(info) = state.registry.processes.get_mut(process) {
            info.handle_refs = info
                .handle_refs
                .checked_add(1)
                .ok_or(TilerError::InvalidArgument)?;
        }
        Ok(())
    }

    /// ハンドル追跡プロセスのクローズ（最後のクローズで破棄）
    pub fn close(&self, pid: Pid) -> TilerResult<()> {
        let mut state = self.lock();
        let process = state
            .registry
            .process_of(Caller::handle(pid))
            .ok_or(TilerError::NotFound)?;
        let info = state
            .registry
            .processes
            .get_mut(process)
            .ok_or(TilerError::NotFound)?;
        info.handle_refs = info
            .handle_refs
            .checked_sub(1)
            .ok_or(TilerError::InvalidArgument)?;
        if info.handle_refs == 0 {
            state.teardown_process(process);
        }
        Ok(())
    }

    /// 呼び出し元のプロセスを明示的に破棄
    pub fn release_process(&self, caller: Caller) -> TilerResult<()> {
        let mut state = self.lock();
        let process = state
            .registry
            .process_of(caller)
            .ok_or(TilerError::NotFound)?;
        state.teardown_process(process);
        Ok(())
    }

    /// 全プロセスを破棄し、キャッシュとダミーページをOSへ返す
    ///
    /// 以後このエンジンは使用しない。
    pub fn teardown(&self) {
        let mut state = self.lock();
        let processes: Vec<ProcessId> = state.registry.processes.iter().map(|(id, _)| id).collect();
        for process in processes {
            state.teardown_process(process);
        }
        if state.registry.orphan_count() != 0 {
            log::warn!(
                "[TILER] teardown: {} orphan(s) still referenced",
                state.registry.orphan_count()
            );
        }
        let state = &mut *state;
        state.pool.purge(&mut *state.provider);
        if let Some(dummy) = state.pat.take_dummy_page() {
            state.provider.free_page(dummy);
        }
        log::info!("[TILER] teardown complete");
    }

    // ========================================
    // メモリ逼迫
    // ========================================

    pub fn set_memory_pressure(&self, on: bool) {
        self.pressure.store(on, Ordering::Release);
    }

    pub fn under_memory_pressure(&self) -> bool {
        self.pressure.load(Ordering::Acquire)
    }

    /// キャッシュ済みページを全てOSへ返す
    pub fn purge(&self) -> usize {
        let mut state = self.lock();
        let state = &mut *state;
        state.pool.purge(&mut *state.provider)
    }

    /// 低メモリシグナルのハンドラ
    ///
    /// 逼迫フラグを立て、キャッシュを返却し、イベントを通知する。
    pub fn on_low_memory(&self) -> usize {
        self.set_memory_pressure(true);
        let mut state = self.lock();
        let state = &mut *state;
        let count = state.pool.purge(&mut *state.provider);
        state.bus.notify(TilerEvent::MemoryPressure);
        state.bus.notify(TilerEvent::PagesPurged { count });
        log::warn!("[TILER] low memory: purged {} pages", count);
        count
    }

    // ========================================
    // 通知バス
    // ========================================

    pub fn subscribe(&self, callback: NotifierFn, arg: usize) -> TilerResult<()> {
        self.lock().bus.subscribe(callback, arg)
    }

    pub fn unsubscribe(&self, callback: NotifierFn, arg: usize) -> TilerResult<()> {
        self.lock().bus.unsubscribe(callback, arg)
    }

    /// イベントを発行（ロック下で同期的に配送）
    pub fn notify(&self, event: TilerEvent) {
        self.lock().bus.notify(event);
    }

    pub fn register_listener(&self, kinds: EventKinds, target: &str) -> TilerResult<()> {
        self.lock().bus.register_listener(kinds, target)
    }

    pub fn unregister_listener(&self, target: &str) -> TilerResult<()> {
        self.lock().bus.unregister_listener(target)
    }

    pub fn take_events(&self, target: &str) -> TilerResult<Vec<TilerEvent>> {
        self.lock().bus.take_events(target)
    }
}
