// ============================================================================
// src/registry/mod.rs - 所有権レジストリ
//
// プロセス → グループ → エリア → ブロックの階層、グローバルブロックリスト、
// およびプロセス破棄後も参照が残るエリア/ブロックの孤児リストを管理する。
//
// エンティティは全て世代チェック付きアリーナに置き、親への参照は
// タグ付き enum (BlockOwner) で表す。孤児は所有者 None。
// コンテナ予約やPATには触れない純粋な帳簿。解放カスケードは engine 側。
// ============================================================================

pub mod arena;

use alloc::vec::Vec;

use hashbrown::HashMap;

pub use arena::{Arena, Id};

use crate::container::{Point, TileArea};
use crate::error::{RefCountError, TilerError, TilerResult};
use crate::geom::{Geometry, PAGE_SIZE, SysAddr, TilerFormat};
use crate::mm::PhysPage;

/// プロセスID
pub type Pid = u32;
/// グループID（プロセス内で一意）
pub type Gid = u32;

pub type ProcessId = Id<ProcessInfo>;
pub type GroupId = Id<GroupInfo>;
pub type AreaId = Id<AreaInfo>;
pub type BlockId = Id<BlockInfo>;

/// プロセスの追跡方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tracking {
    /// 外部（カーネル側）で寿命を管理する
    Kernel,
    /// オープンハンドルの参照カウントで寿命を管理する
    Handle,
}

/// 呼び出し元
///
/// ディスパッチ層が各エントリポイントに渡す。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Caller {
    pub pid: Pid,
    pub tracking: Tracking,
}

impl Caller {
    pub const fn kernel(pid: Pid) -> Self {
        Self {
            pid,
            tracking: Tracking::Kernel,
        }
    }

    pub const fn handle(pid: Pid) -> Self {
        Self {
            pid,
            tracking: Tracking::Handle,
        }
    }
}

/// ブロックの所有者
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOwner {
    /// 2Dブロック: 共有エリア
    Area(AreaId),
    /// 1Dブロック: グループ直下
    Group(GroupId),
}

/// ブロックを裏付ける物理ページ（出所つき）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPages {
    /// ページプールから取得（解放時にプールへ返す）
    Pool(Vec<PhysPage>),
    /// 呼び出し元バッファから解決してピン留め（解放時にアンピン）
    Pinned(Vec<PhysPage>),
    /// map_pages で渡されたページ（エンジンは解放しない）
    Caller(Vec<PhysPage>),
}

impl BlockPages {
    pub fn pages(&self) -> &[PhysPage] {
        match self {
            BlockPages::Pool(p) | BlockPages::Pinned(p) | BlockPages::Caller(p) => p,
        }
    }
}

/// ブロックの論理寸法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDims {
    /// 1D: バイト長
    Linear { length: usize },
    /// 2D: ピクセル幅/高さと、ページ境界に揃えたストライド
    Rect {
        width: usize,
        height: usize,
        stride: usize,
    },
}

/// ブロック記述子（query の結果、バッファハンドルに記録される）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockQuery {
    pub fmt: TilerFormat,
    pub addr: SysAddr,
    pub dims: BlockDims,
}

/// ブロック
#[derive(Debug)]
pub struct BlockInfo {
    pub fmt: TilerFormat,
    /// コンテナ番号
    pub container: usize,
    /// 配置領域
    pub area: TileArea,
    /// 配置から導かれたシステムアドレス
    pub addr: SysAddr,
    /// 要求された幅（2Dはピクセル、1Dはバイト長）
    pub width: usize,
    /// 要求された高さ（1Dは1）
    pub height: usize,
    pub pages: Option<BlockPages>,
    pub refs: u32,
    /// 作成者が保持しているか
    pub alloced: bool,
    /// None は孤児
    pub owner: Option<BlockOwner>,
}

impl BlockInfo {
    /// 参照を1つ追加
    pub fn retain(&mut self) -> Result<(), RefCountError> {
        self.refs = self.refs.checked_add(1).ok_or(RefCountError::Overflow)?;
        Ok(())
    }

    /// 参照を1つ解放し、残りの参照数を返す
    pub fn release(&mut self) -> Result<u32, RefCountError> {
        self.refs = self.refs.checked_sub(1).ok_or(RefCountError::Underflow)?;
        Ok(self.refs)
    }

    /// 破棄条件を満たしているか
    pub fn is_dead(&self) -> bool {
        !self.alloced && self.refs == 0
    }

    /// 記述子を作成
    pub fn describe(&self) -> BlockQuery {
        let dims = if self.fmt.is_2d() {
            BlockDims::Rect {
                width: self.width,
                height: self.height,
                stride: Geometry::vstride(self.fmt, self.area.width() as usize),
            }
        } else {
            BlockDims::Linear { length: self.width }
        };
        BlockQuery {
            fmt: self.fmt,
            addr: self.addr,
            dims,
        }
    }

    /// プロセスにマップする際の長さ（ページ単位）
    pub fn map_length(&self) -> usize {
        self.area.size() * PAGE_SIZE
    }
}

/// 同じ高さのブロックが共有する2Dエリア
#[derive(Debug)]
pub struct AreaInfo {
    pub container: usize,
    pub area: TileArea,
    /// x 順に並んだメンバー
    pub blocks: Vec<BlockId>,
    /// None は孤児
    pub group: Option<GroupId>,
}

/// グループ
#[derive(Debug)]
pub struct GroupInfo {
    pub gid: Gid,
    pub process: ProcessId,
    pub areas: Vec<AreaId>,
    pub onedim: Vec<BlockId>,
    /// 事前予約済み（未使用）ブロック
    pub reserved: Vec<BlockId>,
}

impl GroupInfo {
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty() && self.onedim.is_empty()
    }
}

/// 登録済みバッファハンドル
#[derive(Debug, Clone)]
pub struct BufferHandle {
    /// プロセスのマッピング空間内のページ境界オフセット
    pub offset: u32,
    /// 呼び出し元に返す識別子（offset + 先頭ブロックのページ内オフセット）
    pub id: u32,
    /// マッピング空間で占める長さ
    pub length: usize,
    pub blocks: Vec<BlockId>,
    /// 登録時の記述子
    pub descs: Vec<BlockQuery>,
}

impl BufferHandle {
    /// 識別子がこのハンドルを指すか
    pub fn matches(&self, id: u32) -> bool {
        id & !(PAGE_SIZE as u32 - 1) == self.offset
    }
}

/// プロセス
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub tracking: Tracking,
    /// オープンハンドル数
    pub handle_refs: u32,
    pub groups: Vec<GroupId>,
    /// offset 順
    pub buffers: Vec<BufferHandle>,
    /// 破棄処理中（カスケードによる自動解放を抑止する）
    pub closing: bool,
}

impl ProcessInfo {
    /// `length` バイトを置ける最初の空きオフセット
    pub fn free_buffer_offset(&self, length: usize) -> Option<u32> {
        let mut offset = 0usize;
        for buf in &self.buffers {
            if offset + length <= buf.offset as usize {
                break;
            }
            offset = buf.offset as usize + buf.length;
        }
        u32::try_from(offset + length).ok().map(|_| offset as u32)
    }

    /// offset 順を保って挿入
    pub fn insert_buffer(&mut self, handle: BufferHandle) {
        let pos = self.buffers.partition_point(|b| b.offset < handle.offset);
        self.buffers.insert(pos, handle);
    }

    fn can_release(&self) -> bool {
        !self.closing
            && self.groups.is_empty()
            && self.buffers.is_empty()
            && (self.tracking == Tracking::Kernel || self.handle_refs == 0)
    }
}

/// ブロックをエリア/グループから外した結果
#[derive(Debug)]
pub(crate) struct Detached {
    pub block: BlockInfo,
    /// 解放すべきコンテナ予約
    pub reservation: Option<(usize, TileArea)>,
    /// 空になったかもしれないグループ
    pub group: Option<GroupId>,
}

/// 所有権レジストリ
#[derive(Default)]
pub struct Registry {
    pub(crate) processes: Arena<ProcessInfo>,
    by_owner: HashMap<Caller, ProcessId>,
    pub(crate) groups: Arena<GroupInfo>,
    pub(crate) areas: Arena<AreaInfo>,
    pub(crate) blocks: Arena<BlockInfo>,
    /// 生存中（予約のみのものを除く）の全ブロック
    pub(crate) global: Vec<BlockId>,
    pub(crate) orphan_areas: Vec<AreaId>,
    pub(crate) orphan_onedim: Vec<BlockId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================
    // プロセス / グループ
    // ========================================

    pub fn process_of(&self, caller: Caller) -> Option<ProcessId> {
        self.by_owner.get(&caller).copied()
    }

    /// 呼び出し元のプロセスを取得（なければ作成）
    pub fn get_or_create_process(&mut self, caller: Caller) -> ProcessId {
        if let Some(&id) = self.by_owner.get(&caller) {
            return id;
        }
        let id = self.processes.insert(ProcessInfo {
            pid: caller.pid,
            tracking: caller.tracking,
            handle_refs: 0,
            groups: Vec::new(),
            buffers: Vec::new(),
            closing: false,
        });
        self.by_owner.insert(caller, id);
        log::debug!("[TILER] process {} ({:?}) created", caller.pid, caller.tracking);
        id
    }

    pub fn find_group(&self, process: ProcessId, gid: Gid) -> Option<GroupId> {
        let proc_info = self.processes.get(process)?;
        proc_info
            .groups
            .iter()
            .copied()
            .find(|&g| self.groups.get(g).is_some_and(|info| info.gid == gid))
    }

    /// グループを取得（なければ作成）
    pub fn get_or_create_group(&mut self, process: ProcessId, gid: Gid) -> TilerResult<GroupId> {
        if let Some(id) = self.find_group(process, gid) {
            return Ok(id);
        }
        if !self.processes.contains(process) {
            return Err(TilerError::NotFound);
        }
        let id = self.groups.insert(GroupInfo {
            gid,
            process,
            areas: Vec::new(),
            onedim: Vec::new(),
            reserved: Vec::new(),
        });
        if let Some(proc_info) = self.processes.get_mut(process) {
            proc_info.groups.push(id);
        }
        Ok(id)
    }

    /// グループが空なら破棄（続けてプロセスの解放も試みる）
    pub fn try_release_group(&mut self, group: GroupId) -> bool {
        let Some(info) = self.groups.get(group) else {
            return false;
        };
        if !info.is_empty() {
            return false;
        }
        let process = info.process;
        self.groups.remove(group);
        if let Some(proc_info) = self.processes.get_mut(process) {
            proc_info.groups.retain(|&g| g != group);
        }
        self.try_release_process(process);
        true
    }

    /// 保持するものがなくなったプロセスを破棄
    pub fn try_release_process(&mut self, process: ProcessId) -> bool {
        match self.processes.get(process) {
            Some(info) if info.can_release() => {
                self.remove_process(process);
                true
            }
            _ => false,
        }
    }

    /// プロセスを無条件に取り除く
    pub(crate) fn remove_process(&mut self, process: ProcessId) {
        if let Some(info) = self.processes.remove(process) {
            self.by_owner.remove(&Caller {
                pid: info.pid,
                tracking: info.tracking,
            });
            log::debug!("[TILER] process {} ({:?}) released", info.pid, info.tracking);
        }
    }

    // ========================================
    // ブロック / エリア
    // ========================================

    pub fn block(&self, id: BlockId) -> Option<&BlockInfo> {
        self.blocks.get(id)
    }

    pub fn area(&self, id: AreaId) -> Option<&AreaInfo> {
        self.areas.get(id)
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupInfo> {
        self.groups.get(id)
    }

    pub fn process(&self, id: ProcessId) -> Option<&ProcessInfo> {
        self.processes.get(id)
    }

    /// グローバルリストから座標を含むブロックを探す
    pub fn find_block(&self, container: usize, pt: Point) -> Option<BlockId> {
        self.global.iter().copied().find(|&id| {
            self.blocks
                .get(id)
                .is_some_and(|b| b.container == container && b.area.contains(pt))
        })
    }

    /// エリアのメンバーを x 順に保って挿入
    pub(crate) fn insert_into_area(&mut self, area: AreaId, block: BlockId) {
        let Some(x) = self.blocks.get(block).map(|b| b.area.p0.x) else {
            return;
        };
        let blocks = &self.blocks;
        if let Some(info) = self.areas.get_mut(area) {
            let pos = info
                .blocks
                .partition_point(|&b| blocks.get(b).is_some_and(|m| m.area.p0.x < x));
            info.blocks.insert(pos, block);
        }
    }

    /// ブロックをアリーナから取り除き、所有者から切り離す
    pub(crate) fn detach_block(&mut self, id: BlockId) -> Option<Detached> {
        let block = self.blocks.remove(id)?;
        self.global.retain(|&b| b != id);

        let detached = match block.owner {
            Some(BlockOwner::Area(area_id)) => {
                let mut group = None;
                let mut reservation = None;
                if let Some(area) = self.areas.get_mut(area_id) {
                    area.blocks.retain(|&b| b != id);
                    group = area.group;
                    if area.blocks.is_empty() {
                        reservation = Some((area.container, area.area));
                    }
                }
                if reservation.is_some() {
                    self.areas.remove(area_id);
                    match group {
                        Some(g) => {
                            if let Some(info) = self.groups.get_mut(g) {
                                info.areas.retain(|&a| a != area_id);
                            }
                        }
                        None => self.orphan_areas.retain(|&a| a != area_id),
                    }
                }
                if let Some(info) = group.and_then(|g| self.groups.get_mut(g)) {
                    info.reserved.retain(|&b| b != id);
                }
                Detached {
                    reservation,
                    group,
                    block,
                }
            }
            Some(BlockOwner::Group(group_id)) => {
                if let Some(info) = self.groups.get_mut(group_id) {
                    info.onedim.retain(|&b| b != id);
                }
                Detached {
                    reservation: Some((block.container, block.area)),
                    group: Some(group_id),
                    block,
                }
            }
            None => {
                self.orphan_onedim.retain(|&b| b != id);
                Detached {
                    reservation: Some((block.container, block.area)),
                    group: None,
                    block,
                }
            }
        };
        Some(detached)
    }

    /// エリアをグループから外して孤児リストへ移す
    pub(crate) fn orphan_area(&mut self, area: AreaId) {
        let Some(info) = self.areas.get_mut(area) else {
            return;
        };
        if let Some(group) = info.group.take() {
            if let Some(g) = self.groups.get_mut(group) {
                g.areas.retain(|&a| a != area);
            }
            self.orphan_areas.push(area);
        }
    }

    /// 1Dブロックをグループから外して孤児リストへ移す
    pub(crate) fn orphan_block(&mut self, block: BlockId) {
        let Some(info) = self.blocks.get_mut(block) else {
            return;
        };
        if let Some(BlockOwner::Group(group)) = info.owner.take() {
            if let Some(g) = self.groups.get_mut(group) {
                g.onedim.retain(|&b| b != block);
            }
            self.orphan_onedim.push(block);
        }
    }

    // ========================================
    // 統計
    // ========================================

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    /// 予約のみのブロックも含む
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn live_block_count(&self) -> usize {
        self.global.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_areas.len() + self.orphan_onedim.len()
    }
}
