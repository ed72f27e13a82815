use thiserror::Error;
use veil_buffer::EventRing;

/// 缓冲交接被拒绝的具体原因。
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RebindReason {
    #[error("plaintext buffer still holds {used} bytes")]
    NonEmpty { used: usize },
    #[error("replacement violates the storage contract: {detail}")]
    Incompatible { detail: &'static str },
}

/// 缓冲交接的类型化拒绝。
///
/// 交接失败不是崩溃路径：原因随错误给出，被拒绝的替换缓冲原样归还
/// 调用方，适配器内部的缓冲与注册关系保持不变。
#[derive(Debug, Error)]
#[error("buffer handover rejected: {reason}")]
pub struct RebindError {
    pub reason: RebindReason,
    /// 被拒绝的替换缓冲，原样归还。
    pub replacement: EventRing,
}
