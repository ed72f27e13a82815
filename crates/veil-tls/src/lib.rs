#![doc = r#"
# veil-tls

## 设计动机（Why）
- **非阻塞加密接入**：让事件驱动的网络引擎把加密连接当成普通连接：
  密文推进来、明文拉出去，TLS 握手机制透明完成，任何调用都不阻塞驱动线程；
- **同步引擎的异步化**：底层 TLS 引擎是“调用-返回”式同步状态机，
  本 crate 提供它周边的全部非阻塞管道——定容环形缓冲、单槽位延迟续延、
  后台委托任务线程与事件循环恢复。

## 核心契约（What）
- [`UnwrapRing`]：解密路径与握手接收半边（本仓库的核心组件）；
- [`WrapRing`]：加密路径与握手发送半边，二者经 [`pair`] 以能力受限的
  句柄互相绑定（[`DriveWrap`] / [`DriveUnwrap`]），不形成所有权环；
- [`TlsEngine`]：同步引擎的最小适配面，四态记录层状态
  （[`EngineStatus`]）与五态握手状态（[`HandshakeStatus`]）；
- [`Scheduler`]：事件循环注入的续延入口，后台线程经它交还控制权；
- [`RustlsEngine`]（Feature `engine-rustls`，默认开启）：
  基于 `rustls::Connection` 的引擎实现。

## 实现策略（How）
- 缓冲层复用 `veil-buffer` 的零拷贝区间与事件注册表；
- 每轮驱动只做一次引擎调用，“再试一次”以带标签的延迟动作在调用栈
  退出后循环执行，调用深度恒平；
- Operating 标志覆盖“引擎调用 + 通知补发”窗口，窗口内的再入触发
  合并为单个延迟动作，引擎调用绝不重叠。

## 风险与考量（Trade-offs）
- 加密失败只记录安全日志并终止当轮，不代替调用方关闭连接；
- 缓冲容量小于引擎要求的完整记录尺寸时无法在本层补救，
  记警告后等待上层按停滞拆链。
"#]

mod engine;
mod error;
mod pair;
mod resume;
#[cfg(feature = "engine-rustls")]
mod rustls_engine;
mod task;
mod unwrap;
mod wrap;

pub use engine::{DelegatedTask, EngineError, EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
pub use error::{RebindError, RebindReason};
pub use pair::{DriveUnwrap, DriveWrap, pair};
pub use resume::Scheduler;
#[cfg(feature = "engine-rustls")]
pub use rustls_engine::RustlsEngine;
pub use unwrap::UnwrapRing;
pub use wrap::WrapRing;
