//! `veil-buffer` 提供非阻塞网络栈所需的定容字节环形缓冲与事件注册表。
//!
//! # 模块定位（Why）
//! - 加密/解密流水线两端各需一块固定容量的字节缓冲：网络读入端存放密文，
//!   应用读出端存放明文。两者的水位变化直接驱动上层的背压与重试决策，
//!   因此缓冲必须暴露精确的 `used`/`free` 语义与零拷贝访问窗口。
//! - 事件注册表将“变为可读/变为可写”抽象为电平触发通知，由缓冲的持有者
//!   在状态变化后补发，调用方无需轮询水位。
//!
//! # 设计概要（How）
//! - `ring` 模块实现 [`RingBuffer`]：读写游标分离，支持批量存入/写出、
//!   零拷贝连续区间访问以及数据无损的碎片整理。
//! - `triggers` 模块实现 [`EventTriggers`]：以 `parking_lot::Mutex` 保护的
//!   处理器列表，触发时先快照再回调，避免回调期间持有注册表锁。
//! - [`EventRing`] 将两者捆绑，供“缓冲交接”场景整体换入换出。
//!
//! # 命名约定（Consistency）
//! - 沿用“readable/writable 区间 + consume/extend 游标推进”的零拷贝术语，
//!   与引擎侧的 `unwrap`/`wrap` 调用习惯保持一致。

mod ring;
mod triggers;

pub use ring::{RingBuffer, StoreOutcome};
pub use triggers::{EventRing, EventTriggers, RingEventHandler};
