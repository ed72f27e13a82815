use std::io;

use thiserror::Error;

/// 引擎单次调用的记录层状态。
///
/// # 契约说明（What）
/// - `BufferUnderflow`：输入区间尚不足一个完整记录，属于稳态而非错误；
/// - `BufferOverflow`：输出区间放不下本次产出的明文/密文单元；
/// - `Closed`：对端已发出关闭通知，记录层不再产出数据。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    BufferUnderflow,
    BufferOverflow,
    Closed,
}

/// 引擎握手状态机的五个节点。
///
/// `NeedTask` 表示引擎排队了一段阻塞计算（如非对称密钥运算），
/// 必须移交后台线程执行，完成后经事件循环恢复。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    NeedWrap,
    NeedUnwrap,
    NeedTask,
    Finished,
}

/// 单次 `unwrap`/`wrap` 调用的结果，即取即用，不做持久化。
#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    /// 从输入区间消费的字节数。
    pub consumed: usize,
    /// 写入输出区间的字节数。
    pub produced: usize,
}

/// 引擎排队的委托任务：同步、CPU 密集，必须在事件循环之外执行。
pub type DelegatedTask = Box<dyn FnOnce() + Send>;

/// 引擎层错误。
///
/// 记录被篡改或格式非法时引擎直接拒绝，属于安全相关事件；
/// 本组件只记录日志并终止当轮处理，连接的关闭决策留给调用方。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tls engine rejected the record: {reason}")]
    Crypto { reason: String },
    #[error("tls engine io failure: {0}")]
    Io(#[from] io::Error),
}

/// 同步 TLS 记录层引擎的最小适配面。
///
/// # 设计背景（Why）
/// - 引擎本身是“调用-返回”式的同步状态机，非阻塞性完全由外层的
///   环形缓冲与延迟续延机制提供，因此这里只约定字节区间进出与
///   握手状态查询，不引入任何异步概念。
/// - 引擎会同时被事件循环线程与后台任务线程访问（后者只执行
///   委托任务并查询握手状态），所以接口以 `&self` 表达，
///   实现者自行选择内部互斥策略。
///
/// # 契约说明（What）
/// - `unwrap`/`wrap` 对传入区间做零拷贝读写，返回消费/产出字节数，
///   实现不得越过区间边界；
/// - `next_delegated_task` 每次取出一个待执行任务，队列为空返回 `None`；
/// - `record_size_hint` 给出单个完整加密记录的保守尺寸上界，
///   用于区分“等待更多数据”与“缓冲容量根本不足”。
pub trait TlsEngine: Send + Sync {
    /// 解密方向：密文区间进，明文区间出，附带握手接收处理。
    fn unwrap(&self, input: &[u8], output: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// 加密方向：明文区间进，密文区间出，附带握手发送处理。
    fn wrap(&self, input: &[u8], output: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// 当前握手状态；握手完成的 `Finished` 只会出现在调用结果中，
    /// 此查询在握手结束后返回 `NotHandshaking`。
    fn handshake_status(&self) -> HandshakeStatus;

    /// 取出下一个待执行的委托任务。
    fn next_delegated_task(&self) -> Option<DelegatedTask>;

    /// 单个完整加密记录的期望尺寸上界。
    fn record_size_hint(&self) -> usize;
}
