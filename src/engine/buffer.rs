// ============================================================================
// src/engine/buffer.rs - バッファ登録
//
// 既存ブロックの集合をハンドルとして登録し、他プロセスへ共有する。
// ハンドルは各メンバーブロックの参照を1つずつ保持する。
// ハンドルIDはプロセスのマッピング空間内のページ境界オフセット
// （＋先頭ブロックのページ内オフセット）。
// ============================================================================

use alloc::vec::Vec;

use super::{TilerEngine, bump};
use crate::error::{TilerError, TilerResult};
use crate::geom::SysAddr;
use crate::mm::PhysPage;
use crate::registry::{BlockQuery, BufferHandle, Caller};

/// プロセスへのマッピングの1区間
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapSegment {
    /// 2Dブロック: 裏付けページをそのまま並べる
    Pages { offset: usize, pages: Vec<PhysPage> },
    /// 1Dブロック: ページビューのページ境界に揃えた線形窓
    Linear {
        offset: usize,
        sys_addr: SysAddr,
        len: usize,
    },
}

/// ハンドルをプロセスにマップするためのレイアウト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMapping {
    /// マッピング空間での開始オフセット（ページ境界）
    pub base: u32,
    pub length: usize,
    /// base からのオフセット順
    pub segments: Vec<MapSegment>,
}

impl TilerEngine {
    /// ブロック群をバッファハンドルとして登録
    ///
    /// 1つでも解決できないアドレスがあれば何も登録せず AccessDenied。
    pub fn register_buffer(&self, caller: Caller, addrs: &[SysAddr]) -> TilerResult<u32> {
        let mut state = self.lock();
        if addrs.is_empty() || addrs.len() > state.config.max_buffer_blocks {
            return Err(TilerError::InvalidArgument);
        }

        let mut blocks = Vec::with_capacity(addrs.len());
        let mut descs = Vec::with_capacity(addrs.len());
        let mut length = 0usize;
        for &addr in addrs {
            let id = state.lookup(addr).map_err(|_| TilerError::AccessDenied)?;
            let block = state.registry.blocks.get(id).ok_or(TilerError::AccessDenied)?;
            let mut desc = block.describe();
            desc.addr = addr;
            length += block.map_length();
            blocks.push(id);
            descs.push(desc);
        }

        let process = state.registry.get_or_create_process(caller);
        let offset = state
            .registry
            .processes
            .get(process)
            .and_then(|p| p.free_buffer_offset(length))
            .ok_or(TilerError::OutOfMemory)?;

        for (i, &id) in blocks.iter().enumerate() {
            let retained = state
                .registry
                .blocks
                .get_mut(id)
                .ok_or(TilerError::NotFound)
                .and_then(|b| b.retain().map_err(TilerError::from));
            if let Err(e) = retained {
                // 取得済みの参照を戻す
                for &done in &blocks[..i] {
                    let _ = state.release_ref(done);
                }
                state.registry.try_release_process(process);
                return Err(e);
            }
        }

        let id = offset + addrs[0].page_offset() as u32;
        if let Some(info) = state.registry.processes.get_mut(process) {
            info.insert_buffer(BufferHandle {
                offset,
                id,
                length,
                blocks,
                descs,
            });
        }
        bump(&mut state.counters.buffers_registered);
        log::debug!("[TILER] pid {} registered buffer {:#x} ({} bytes)", caller.pid, id, length);
        Ok(id)
    }

    /// バッファハンドルを解除し、メンバーの参照を解放
    pub fn unregister_buffer(&self, caller: Caller, id: u32) -> TilerResult<()> {
        let mut state = self.lock();
        let process = state
            .registry
            .process_of(caller)
            .ok_or(TilerError::NotFound)?;
        let info = state
            .registry
            .processes
            .get_mut(process)
            .ok_or(TilerError::NotFound)?;
        let pos = info
            .buffers
            .iter()
            .position(|b| b.matches(id))
            .ok_or(TilerError::NotFound)?;
        let handle = info.buffers.remove(pos);

        for block in handle.blocks {
            if let Err(e) = state.release_ref(block) {
                log::warn!("[TILER] buffer {:#x}: {}", id, e);
            }
        }
        state.registry.try_release_process(process);
        Ok(())
    }

    /// 登録時の記述子をそのまま返す
    pub fn query_buffer(&self, caller: Caller, id: u32) -> TilerResult<Vec<BlockQuery>> {
        let state = self.lock();
        let process = state
            .registry
            .process_of(caller)
            .ok_or(TilerError::NotFound)?;
        state
            .registry
            .process(process)
            .and_then(|p| p.buffers.iter().find(|b| b.matches(id)))
            .map(|b| b.descs.clone())
            .ok_or(TilerError::NotFound)
    }

    /// ハンドルのメンバーを呼び出し元プロセスに並べるレイアウトを作成
    pub fn map_to_process(&self, caller: Caller, id: u32) -> TilerResult<ProcessMapping> {
        let state = self.lock();
        let process = state
            .registry
            .process_of(caller)
            .ok_or(TilerError::NotFound)?;
        let handle = state
            .registry
            .process(process)
            .and_then(|p| p.buffers.iter().find(|b| b.matches(id)))
            .ok_or(TilerError::NotFound)?;

        let mut segments = Vec::with_capacity(handle.blocks.len());
        let mut offset = 0usize;
        for &block_id in &handle.blocks {
            let block = state.registry.block(block_id).ok_or(TilerError::NotFound)?;
            let len = block.map_length();
            let segment = if block.fmt.is_2d() {
                // 裏付けのない領域はマップできない
                let pages = block.pages.as_ref().ok_or(TilerError::NotPermitted)?;
                MapSegment::Pages {
                    offset,
                    pages: pages.pages().to_vec(),
                }
            } else {
                MapSegment::Linear {
                    offset,
                    sys_addr: block.addr.page_base(),
                    len,
                }
            };
            segments.push(segment);
            offset += len;
        }
        Ok(ProcessMapping {
            base: handle.offset,
            length: offset,
            segments,
        })
    }
}
