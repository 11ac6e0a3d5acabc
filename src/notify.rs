// ============================================================================
// src/notify.rs - 通知バス
//
// 登録順に同期的に呼び出されるコールバックのリストと、
// ターゲット名ごとのメールボックスを持つ名前付きリスナー。
// notify はエンジンのロック下で呼ばれるため、コールバックから
// エンジンを呼び戻してはならない（デッドロックする）。
// ============================================================================

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{TilerError, TilerResult};
use crate::registry::Pid;

/// メールボックスに溜められるイベント数
pub const MAILBOX_DEPTH: usize = 64;

/// ライフサイクルイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilerEvent {
    /// バッファハンドルを持つプロセスが破棄される（ハンドル解除前）
    ProcessClose { pid: Pid },
    /// メモリ逼迫を検知
    MemoryPressure,
    /// キャッシュ済みページをOSへ返却した
    PagesPurged { count: usize },
}

bitflags! {
    /// リスナーが購読するイベント種別
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventKinds: u8 {
        const PROCESS_CLOSE = 1 << 0;
        const MEMORY_PRESSURE = 1 << 1;
        const PAGES_PURGED = 1 << 2;
        const ALL = Self::PROCESS_CLOSE.bits()
            | Self::MEMORY_PRESSURE.bits()
            | Self::PAGES_PURGED.bits();
    }
}

impl TilerEvent {
    pub fn kind(&self) -> EventKinds {
        match self {
            TilerEvent::ProcessClose { .. } => EventKinds::PROCESS_CLOSE,
            TilerEvent::MemoryPressure => EventKinds::MEMORY_PRESSURE,
            TilerEvent::PagesPurged { .. } => EventKinds::PAGES_PURGED,
        }
    }
}

/// 通知コールバック（第2引数は登録時のユーザー引数）
pub type NotifierFn = fn(&TilerEvent, usize);

struct Subscriber {
    callback: NotifierFn,
    arg: usize,
}

impl Subscriber {
    fn is(&self, callback: NotifierFn, arg: usize) -> bool {
        core::ptr::fn_addr_eq(self.callback, callback) && self.arg == arg
    }
}

struct Listener {
    target: String,
    kinds: EventKinds,
    mailbox: VecDeque<TilerEvent>,
}

/// 通知バス
#[derive(Default)]
pub struct NotificationBus {
    subscribers: Vec<Subscriber>,
    listeners: Vec<Listener>,
}

impl NotificationBus {
    pub const fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// コールバックを登録（同じ組は二重登録できない）
    pub fn subscribe(&mut self, callback: NotifierFn, arg: usize) -> TilerResult<()> {
        if self.subscribers.iter().any(|s| s.is(callback, arg)) {
            return Err(TilerError::AlreadyInUse);
        }
        self.subscribers.push(Subscriber { callback, arg });
        Ok(())
    }

    /// コールバックを登録解除
    pub fn unsubscribe(&mut self, callback: NotifierFn, arg: usize) -> TilerResult<()> {
        let pos = self
            .subscribers
            .iter()
            .position(|s| s.is(callback, arg))
            .ok_or(TilerError::NotFound)?;
        self.subscribers.remove(pos);
        Ok(())
    }

    /// イベントを配送
    pub fn notify(&mut self, event: TilerEvent) {
        log::debug!("[TILER] event {:?}", event);
        for sub in &self.subscribers {
            (sub.callback)(&event, sub.arg);
        }
        let kind = event.kind();
        for listener in self.listeners.iter_mut().filter(|l| l.kinds.intersects(kind)) {
            if listener.mailbox.len() >= MAILBOX_DEPTH {
                log::warn!("[TILER] mailbox '{}' full, dropping oldest event", listener.target);
                listener.mailbox.pop_front();
            }
            listener.mailbox.push_back(event);
        }
    }

    /// 名前付きリスナーを登録
    pub fn register_listener(&mut self, kinds: EventKinds, target: &str) -> TilerResult<()> {
        if target.is_empty() || kinds.is_empty() {
            return Err(TilerError::InvalidArgument);
        }
        if self.listeners.iter().any(|l| l.target == target) {
            return Err(TilerError::AlreadyInUse);
        }
        self.listeners.push(Listener {
            target: String::from(target),
            kinds,
            mailbox: VecDeque::new(),
        });
        Ok(())
    }

    pub fn unregister_listener(&mut self, target: &str) -> TilerResult<()> {
        let pos = self
            .listeners
            .iter()
            .position(|l| l.target == target)
            .ok_or(TilerError::NotFound)?;
        self.listeners.remove(pos);
        Ok(())
    }

    /// メールボックスの中身を取り出す
    pub fn take_events(&mut self, target: &str) -> TilerResult<Vec<TilerEvent>> {
        let listener = self
            .listeners
            .iter_mut()
            .find(|l| l.target == target)
            .ok_or(TilerError::NotFound)?;
        Ok(listener.mailbox.drain(..).collect())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn count_event(_event: &TilerEvent, arg: usize) {
        SEEN.fetch_add(arg, Ordering::SeqCst);
    }

    fn other_callback(_event: &TilerEvent, _arg: usize) {}

    #[test]
    fn test_subscribe_notify_unsubscribe() {
        let mut bus = NotificationBus::new();
        bus.subscribe(count_event, 10).unwrap();
        bus.subscribe(count_event, 1).unwrap();
        assert_eq!(bus.subscribe(count_event, 10), Err(TilerError::AlreadyInUse));
        bus.subscribe(other_callback, 10).unwrap();

        let before = SEEN.load(Ordering::SeqCst);
        bus.notify(TilerEvent::MemoryPressure);
        assert_eq!(SEEN.load(Ordering::SeqCst) - before, 11);

        bus.unsubscribe(count_event, 10).unwrap();
        assert_eq!(bus.unsubscribe(count_event, 10), Err(TilerError::NotFound));
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_listener_filters_by_kind() {
        let mut bus = NotificationBus::new();
        bus.register_listener(EventKinds::PROCESS_CLOSE, "display").unwrap();
        bus.register_listener(EventKinds::ALL, "monitor").unwrap();
        assert_eq!(
            bus.register_listener(EventKinds::ALL, "display"),
            Err(TilerError::AlreadyInUse)
        );

        bus.notify(TilerEvent::PagesPurged { count: 3 });
        bus.notify(TilerEvent::ProcessClose { pid: 42 });

        assert_eq!(
            bus.take_events("display").unwrap(),
            alloc::vec![TilerEvent::ProcessClose { pid: 42 }]
        );
        assert_eq!(bus.take_events("monitor").unwrap().len(), 2);
        assert!(bus.take_events("monitor").unwrap().is_empty());

        bus.unregister_listener("display").unwrap();
        assert_eq!(bus.take_events("display"), Err(TilerError::NotFound));
    }

    #[test]
    fn test_mailbox_drops_oldest_when_full() {
        let mut bus = NotificationBus::new();
        bus.register_listener(EventKinds::PAGES_PURGED, "log").unwrap();
        for count in 0..MAILBOX_DEPTH + 2 {
            bus.notify(TilerEvent::PagesPurged { count });
        }
        let events = bus.take_events("log").unwrap();
        assert_eq!(events.len(), MAILBOX_DEPTH);
        assert_eq!(events[0], TilerEvent::PagesPurged { count: 2 });
    }
}
