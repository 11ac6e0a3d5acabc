// ============================================================================
// tests/integration_test.rs - タイラーエンジン統合テスト
// ============================================================================
//
// 模擬OS/PATバックエンド上で、公開APIだけを使って
// 割り当て・共有・プロセス破棄・まとめ割り当ての性質を確認する。

use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use tiler_mm::container::{GridContainer, Point, TileArea, TileContainer};
use tiler_mm::error::ContainerError;
use tiler_mm::sim::{SimPageProvider, SimRemapTable};
use tiler_mm::{
    AllocRequest, BlockDims, Caller, PAGE_SIZE, SysAddr, TilerConfig, TilerEngine, TilerError,
    TilerFormat,
};

// ============================================================================
// テスト用ヘルパー
// ============================================================================

fn engine() -> (TilerEngine, SimPageProvider, SimRemapTable) {
    let provider = SimPageProvider::new();
    let table = SimRemapTable::new(256, 128);
    let engine = TilerEngine::new(
        TilerConfig::default(),
        Box::new(provider.clone()),
        Box::new(table.clone()),
    )
    .unwrap();
    (engine, provider, table)
}

/// 予約の重なりと範囲外を検出するコンテナ
struct CheckedContainer {
    inner: GridContainer,
    live: Arc<Mutex<Vec<TileArea>>>,
}

impl CheckedContainer {
    fn record(&self, area: TileArea) -> TileArea {
        assert!(area.p1.x < self.inner.width() && area.p1.y < self.inner.height());
        let mut live = self.live.lock().unwrap();
        for other in live.iter() {
            assert!(!area.overlaps(other), "{:?} overlaps {:?}", area, other);
        }
        live.push(area);
        area
    }
}

impl TileContainer for CheckedContainer {
    fn width(&self) -> u16 {
        self.inner.width()
    }

    fn height(&self) -> u16 {
        self.inner.height()
    }

    fn reserve_2d(&mut self, width: u16, height: u16, align: u16) -> Result<TileArea, ContainerError> {
        let area = self.inner.reserve_2d(width, height, align)?;
        Ok(self.record(area))
    }

    fn reserve_1d(&mut self, slots: usize) -> Result<TileArea, ContainerError> {
        let area = self.inner.reserve_1d(slots)?;
        Ok(self.record(area))
    }

    fn free(&mut self, area: &TileArea) -> Result<(), ContainerError> {
        self.inner.free(area)?;
        self.live.lock().unwrap().retain(|a| a != area);
        Ok(())
    }
}

// ============================================================================
// テストケース
// ============================================================================

#[test]
fn double_free_reports_not_found() {
    let (engine, _, _) = engine();
    let k = Caller::kernel(1);
    let addr = engine
        .allocate(k, &AllocRequest::new(TilerFormat::Bit16, 256, 48))
        .unwrap();
    engine.free(addr).unwrap();
    assert_eq!(engine.free(addr), Err(TilerError::NotFound));
    assert_eq!(engine.query(addr), Err(TilerError::NotFound));
}

#[test]
fn single_block_lifecycle_removes_area_and_group() {
    let (engine, provider, _) = engine();
    let k = Caller::kernel(1);
    let addr = engine
        .allocate(k, &AllocRequest::new(TilerFormat::Bit8, 64, 64))
        .unwrap();
    let stats = engine.stats();
    assert_eq!((stats.areas, stats.groups, stats.blocks), (1, 1, 1));

    engine.free(addr).unwrap();
    let stats = engine.stats();
    assert_eq!((stats.areas, stats.groups, stats.processes), (0, 0, 0));
    assert_eq!(stats.used_slots, 0);

    // キャッシュを返せばダミーページだけが残る
    engine.purge();
    assert_eq!(provider.live_pages(), 1);
}

#[test]
fn same_height_blocks_share_one_area() {
    let (engine, _, _) = engine();
    let k = Caller::kernel(1);
    let req = AllocRequest::new(TilerFormat::Bit8, 64, 64);
    let a = engine.allocate(k, &req).unwrap();
    let b = engine.allocate(k, &req).unwrap();
    assert_eq!(engine.stats().areas, 1);

    engine.free(a).unwrap();
    assert_eq!(engine.stats().areas, 1);
    assert!(engine.query(b).is_ok());
    engine.free(b).unwrap();
    assert_eq!(engine.stats().areas, 0);
}

#[test]
fn registered_buffer_outlives_free() {
    let (engine, _, _) = engine();
    let k = Caller::kernel(1);
    let addr = engine
        .allocate(k, &AllocRequest::new(TilerFormat::Bit32, 128, 64))
        .unwrap();
    let handle = engine.register_buffer(k, &[addr]).unwrap();

    engine.free(addr).unwrap();
    assert!(engine.query(addr).is_ok());

    engine.unregister_buffer(k, handle).unwrap();
    assert_eq!(engine.query(addr), Err(TilerError::NotFound));
    let stats = engine.stats();
    assert_eq!((stats.blocks, stats.areas, stats.processes), (0, 0, 0));
}

#[test]
fn orphan_survives_owner_teardown() {
    let (engine, _, _) = engine();
    let owner = Caller::handle(10);
    let sharer = Caller::kernel(20);
    engine.open(10).unwrap();

    let tiled = engine
        .allocate(owner, &AllocRequest::new(TilerFormat::Bit8, 64, 64))
        .unwrap();
    let linear = engine
        .allocate(owner, &AllocRequest::new(TilerFormat::Page, PAGE_SIZE, 1))
        .unwrap();
    let handle = engine.register_buffer(sharer, &[tiled, linear]).unwrap();

    // 所有プロセスが閉じてもブロックは共有先から使える
    engine.close(10).unwrap();
    let stats = engine.stats();
    assert_eq!(stats.orphans, 2);
    assert_eq!(stats.processes, 1);
    assert!(engine.query(tiled).is_ok());
    assert!(engine.query(linear).is_ok());
    assert_eq!(engine.free(tiled), Err(TilerError::NotFound));

    engine.unregister_buffer(sharer, handle).unwrap();
    let stats = engine.stats();
    assert_eq!((stats.orphans, stats.blocks, stats.processes), (0, 0, 0));
    assert_eq!(stats.used_slots, 0);
}

#[test]
fn packed_uniform_owners_cover_their_buffers() {
    let (engine, _, _) = engine();
    let k = Caller::kernel(1);
    let packed = engine
        .pack_uniform(k, 5, TilerFormat::Page, 3000, 1, false, 0)
        .unwrap();
    assert!(packed.len() <= 5);
    assert!(!packed.is_empty());

    let mut current: Option<(SysAddr, usize)> = None;
    for (addr, owner) in packed.addrs.iter().zip(&packed.owners) {
        if let Some(base) = owner {
            assert_eq!(addr, base);
            let length = match engine.query(*base).unwrap().dims {
                BlockDims::Linear { length } => length,
                other => panic!("unexpected dims {:?}", other),
            };
            current = Some((*base, length));
        }
        let (base, length) = current.expect("first buffer must own its block");
        assert!(addr.as_u32() >= base.as_u32());
        assert!(addr.as_u32() < base.as_u32() + length as u32);
    }

    for owner in packed.owners.iter().flatten() {
        engine.free(*owner).unwrap();
    }
    assert_eq!(engine.stats().blocks, 0);
}

#[test]
fn placements_never_overlap_and_stay_in_bounds() {
    let live = Arc::new(Mutex::new(Vec::new()));
    let container = CheckedContainer {
        inner: GridContainer::new(256, 128),
        live: live.clone(),
    };
    let table = SimRemapTable::new(256, 128);
    let engine = TilerEngine::with_containers(
        TilerConfig::default(),
        vec![Box::new(container) as Box<dyn TileContainer>],
        Box::new(SimPageProvider::new()),
        Box::new(table.clone()),
    )
    .unwrap();

    let shapes = [
        (TilerFormat::Bit8, 176, 144),
        (TilerFormat::Bit16, 352, 288),
        (TilerFormat::Bit32, 64, 64),
        (TilerFormat::Bit8, 64, 64),
        (TilerFormat::Page, 3 * PAGE_SIZE + 100, 1),
        (TilerFormat::Bit16, 100, 20),
    ];
    let mut addrs = Vec::new();
    for round in 0..6u32 {
        for &(fmt, w, h) in &shapes {
            let caller = Caller::kernel(round % 3);
            let req = AllocRequest::new(fmt, w, h).group(round % 2);
            addrs.push(engine.allocate(caller, &req).unwrap());
        }
        // 一部を解放して隙間を作る
        if round % 2 == 1 {
            for addr in addrs.drain(..3) {
                engine.free(addr).unwrap();
            }
        }
    }

    // 各ブロックの先頭スロットは別々のページに写る
    let geom = engine.geometry();
    let mut origins = HashSet::new();
    for addr in &addrs {
        let (_, pt) = geom.decode(*addr).unwrap();
        assert!(pt.x < 256 && pt.y < 128);
        let entry = table.entry(pt.x, pt.y).unwrap();
        assert!(origins.insert(entry), "{} shares its first page", addr);
    }

    for addr in addrs {
        engine.free(addr).unwrap();
    }
    assert!(live.lock().unwrap().is_empty());
    assert_eq!(engine.stats().used_slots, 0);
}

#[test]
fn concurrent_callers_leave_nothing_behind() {
    const THREADS: u32 = 4;
    let live = Arc::new(Mutex::new(Vec::new()));
    let container = CheckedContainer {
        inner: GridContainer::new(256, 128),
        live: live.clone(),
    };
    let engine = Arc::new(
        TilerEngine::with_containers(
            TilerConfig::default(),
            vec![Box::new(container) as Box<dyn TileContainer>],
            Box::new(SimPageProvider::new()),
            Box::new(SimRemapTable::new(256, 128)),
        )
        .unwrap(),
    );

    let shapes = [
        (TilerFormat::Bit8, 64, 64),
        (TilerFormat::Bit16, 128, 32),
        (TilerFormat::Page, 3 * PAGE_SIZE, 1),
        (TilerFormat::Bit32, 64, 64),
    ];
    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let pid = 100 + t;
                let owner = Caller::handle(pid);
                let sharer = Caller::kernel(200 + t);
                engine.open(pid).unwrap();
                barrier.wait();

                let mut handles = Vec::new();
                let mut kept = Vec::new();
                for i in 0..24usize {
                    let (fmt, w, h) = shapes[(i + t as usize) % shapes.len()];
                    let req = AllocRequest::new(fmt, w, h).group(i as u32 % 2);
                    let addr = engine.allocate(owner, &req).unwrap();
                    match i % 3 {
                        // 共有してから作成者側を解放
                        0 => {
                            handles.push(engine.register_buffer(sharer, &[addr]).unwrap());
                            engine.free(addr).unwrap();
                        }
                        // プロセス破棄まで持ち続ける
                        1 => kept.push(addr),
                        _ => engine.free(addr).unwrap(),
                    }
                }

                assert_eq!(kept.len(), 8);
                engine.close(pid).unwrap();
                for handle in handles {
                    engine.unregister_buffer(sharer, handle).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = engine.stats();
    assert_eq!((stats.blocks, stats.areas, stats.used_slots), (0, 0, 0));
    assert_eq!((stats.processes, stats.groups, stats.orphans), (0, 0, 0));
    assert!(live.lock().unwrap().is_empty());
}

#[test]
fn user_buffer_mapping_round_trip() {
    let (engine, provider, table) = engine();
    let k = Caller::kernel(7);
    let addr = engine
        .map_existing(k, TilerFormat::Bit8, 128, 64, 0, 0x2000_0000)
        .unwrap();
    assert_eq!(provider.pinned_pages(), 2);
    let (_, pt) = engine.geometry().decode(addr).unwrap();
    assert!(table.entry(pt.x, pt.y).is_some());

    engine.free(addr).unwrap();
    assert_eq!(provider.pinned_pages(), 0);
    assert_eq!(engine.query(addr), Err(TilerError::NotFound));
}

#[test]
fn origin_point_decodes_back() {
    let (engine, _, _) = engine();
    let addr = engine
        .allocate(Caller::kernel(1), &AllocRequest::new(TilerFormat::Bit32, 32, 32))
        .unwrap();
    let (fmt, pt) = engine.geometry().decode(addr).unwrap();
    assert_eq!(fmt, TilerFormat::Bit32);
    assert_eq!(engine.geometry().addr_of(fmt, pt), addr);
    assert_eq!(pt, Point::new(0, 0));
}
