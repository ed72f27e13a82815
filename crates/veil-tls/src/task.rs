use std::sync::Arc;
use std::thread;

use crate::engine::{HandshakeStatus, TlsEngine};
use crate::resume::Scheduler;

/// 后台排空引擎的委托任务，结束后把控制权交还事件循环。
///
/// # 逻辑解析（How）
/// - 引擎进入 `NeedTask` 时排队的是同步 CPU 密集计算（典型为握手期的
///   非对称密钥运算），直接在事件循环上执行会阻塞其余连接，
///   因此另起一条线程逐个跑完；
/// - 任务排空后查询引擎此刻的握手状态：需要发出握手消息或已完成，
///   经调度器恢复 wrap 侧；其余情况恢复 unwrap 侧。
///   恢复动作一律经 `Scheduler` 交还事件循环线程，绝不在工作线程上执行；
/// - 工作线程不持有任何缓冲状态，只触碰引擎对象本身。
pub(crate) fn drain_delegated_tasks(
    engine: Arc<dyn TlsEngine>,
    scheduler: Arc<dyn Scheduler>,
    resume_wrap: Box<dyn FnOnce() + Send>,
    resume_unwrap: Box<dyn FnOnce() + Send>,
) {
    let spawned = thread::Builder::new()
        .name("veil-tls-task".into())
        .spawn(move || {
            while let Some(task) = engine.next_delegated_task() {
                task();
            }
            match engine.handshake_status() {
                HandshakeStatus::NeedWrap | HandshakeStatus::Finished => {
                    scheduler.schedule(resume_wrap);
                }
                _ => scheduler.schedule(resume_unwrap),
            }
        });
    if let Err(err) = spawned {
        tracing::error!(error = %err, "无法创建委托任务线程，握手将停滞");
    }
}
