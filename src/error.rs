//! 統一エラーハンドリングモジュール
//!
//! タイラーエンジン全体で使用される統一エラー型を定義し、
//! 各コンポーネント（コンテナ、ページプール、PAT、参照カウント）の
//! エラーから変換を提供します。

use core::fmt;

/// エンジン全体の統一エラー型
///
/// エンジン境界を越えるのはこの型のみ。
/// 多段階の操作が途中で失敗した場合は、返却前に完全にロールバックされる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilerError {
    /// 不正なサイズ/アライメント/オフセット、または不正なリクエスト
    InvalidArgument,
    /// ページプール枯渇、またはコンテナ予約失敗
    OutOfMemory,
    /// 該当するブロック/ハンドルが存在しない
    NotFound,
    /// 既にマップ済み、または登録済み
    AlreadyInUse,
    /// このフォーマット/コンテナではリマップ不可
    NotPermitted,
    /// リマップテーブルのプログラミング失敗
    Fault,
    /// バッファ登録時にアドレスを解決できなかった
    AccessDenied,
}

/// タイルコンテナのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerError {
    /// 幅/高さ/長さが不正
    InvalidSize,
    /// 空き領域なし
    NoSpace,
    /// 予約されていない領域の解放
    NotReserved,
}

/// ページプールのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// 上限到達またはOSからの取得失敗
    Exhausted,
    /// 呼び出し元バッファの物理ページ解決に失敗
    ResolveFailed,
}

/// PATエンジンのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatError {
    /// ページリストが領域より短い
    ShortPageList,
    /// ハードウェアのリフィル失敗
    RefillFailed,
    /// ダミーページが未設定
    NoDummyPage,
}

/// 参照カウントのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCountError {
    /// 0からの減算
    Underflow,
    /// u32 の上限超過
    Overflow,
}

// ===== Display implementations =====

impl fmt::Display for TilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TilerError::InvalidArgument => write!(f, "invalid argument"),
            TilerError::OutOfMemory => write!(f, "out of memory"),
            TilerError::NotFound => write!(f, "not found"),
            TilerError::AlreadyInUse => write!(f, "already in use"),
            TilerError::NotPermitted => write!(f, "not permitted"),
            TilerError::Fault => write!(f, "remap fault"),
            TilerError::AccessDenied => write!(f, "access denied"),
        }
    }
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::InvalidSize => write!(f, "invalid area size"),
            ContainerError::NoSpace => write!(f, "container exhausted"),
            ContainerError::NotReserved => write!(f, "area not reserved"),
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted => write!(f, "page pool exhausted"),
            PoolError::ResolveFailed => write!(f, "could not resolve buffer pages"),
        }
    }
}

impl fmt::Display for PatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatError::ShortPageList => write!(f, "page list shorter than area"),
            PatError::RefillFailed => write!(f, "PAT refill failed"),
            PatError::NoDummyPage => write!(f, "no dummy page"),
        }
    }
}

impl fmt::Display for RefCountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefCountError::Underflow => write!(f, "reference count underflow"),
            RefCountError::Overflow => write!(f, "reference count overflow"),
        }
    }
}

// ===== From implementations for sub-errors =====

impl From<ContainerError> for TilerError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::InvalidSize => TilerError::InvalidArgument,
            ContainerError::NoSpace => TilerError::OutOfMemory,
            ContainerError::NotReserved => TilerError::NotFound,
        }
    }
}

impl From<PoolError> for TilerError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted => TilerError::OutOfMemory,
            PoolError::ResolveFailed => TilerError::Fault,
        }
    }
}

impl From<PatError> for TilerError {
    fn from(e: PatError) -> Self {
        match e {
            PatError::ShortPageList => TilerError::InvalidArgument,
            PatError::RefillFailed | PatError::NoDummyPage => TilerError::Fault,
        }
    }
}

impl From<RefCountError> for TilerError {
    fn from(_: RefCountError) -> Self {
        TilerError::InvalidArgument
    }
}

// ===== Result type alias =====

/// エンジンの結果型エイリアス
pub type TilerResult<T> = Result<T, TilerError>;
