use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use veil_buffer::{EventRing, EventTriggers, RingBuffer, RingEventHandler, StoreOutcome};

use crate::engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
use crate::error::{RebindError, RebindReason};
use crate::pair::{DriveUnwrap, DriveWrap};
use crate::resume::{DeferredSlot, PendingAction, Scheduler};
use crate::task;

/// 解包引擎：非阻塞解密路径与握手接收半边的编排核心。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让事件驱动的网络层把加密连接当成普通连接使用：密文推进来、
///   明文拉出去，握手机制完全透明，任何调用都不阻塞驱动线程；
/// - 引擎本身是同步状态机，这里的职责是把它的
///   underflow/overflow/握手信号翻译成缓冲操作与延迟续延。
///
/// ## 逻辑（How）
/// - 一轮驱动（`run_unwrap`）= 一次引擎调用 + 结果分发；“还要再试”
///   通过单槽位延迟动作表达，在本轮调用栈退出后以循环（而非递归）
///   执行，调用深度恒平；
/// - Operating 标志覆盖“引擎调用 + 通知补发”窗口：窗口内到达的再入
///   触发被合并为单个延迟动作，保证引擎调用绝不重叠；
/// - `NeedTask` 移交后台线程排空委托任务，经调度器回到事件循环恢复；
/// - 内部处理器挂在明文缓冲的注册表上：应用读走明文（可写事件）时
///   顺势重试解包，明文新增（可读事件）时向网络层转发可读通知。
///
/// ## 契约（What）
/// - `feed`：网络字节入口，关闭后幂等地丢弃并返回 0；
/// - `drain_to`：应用读取明文；`rebind`：空明文缓冲的原子交接；
/// - 通知为电平触发、尽力而为：输入缓冲“满 → 非满”恰好补发一次
///   可写通知（背压解除信号）。
///
/// ## 风险与权衡（Trade-offs）
/// - 加密失败（记录被篡改）只记录安全日志并终止当轮，不主动关闭
///   连接：调用方依据停滞自行拆链，策略见 DESIGN.md；
/// - 明文缓冲满且无碎片可整理时本侧无计可施，等待应用读取解除。
pub struct UnwrapRing {
    inner: Mutex<UnwrapState>,
    engine: Arc<dyn TlsEngine>,
    scheduler: Arc<dyn Scheduler>,
    pair: OnceLock<Arc<dyn DriveWrap>>,
    /// 面向网络层的通知注册表：可读 = 有新明文，可写 = 输入缓冲重新有空间。
    triggers: Arc<EventTriggers>,
    /// 挂在明文缓冲注册表上的内部处理器，交接时随缓冲迁移。
    app_hook: Arc<dyn RingEventHandler>,
    self_weak: Weak<UnwrapRing>,
    closed: AtomicBool,
}

struct UnwrapState {
    /// 明文输出缓冲（应用读取端），可经 `rebind` 整体换出。
    app: EventRing,
    /// 加密输入缓冲（网络读入端），容量构造时固定。
    encrypted: RingBuffer,
    operating: bool,
    deferred: DeferredSlot,
}

/// 明文缓冲事件的内部钩子。
///
/// 可读事件向上转发给网络层（明文就绪）；可写事件意味着应用读走了
/// 数据、输出端重新有空间，顺势重试解包。
struct AppBufferHook {
    ring: Weak<UnwrapRing>,
}

impl RingEventHandler for AppBufferHook {
    fn on_readable(&self) {
        if let Some(ring) = self.ring.upgrade() {
            ring.triggers.fire_readable();
        }
    }

    fn on_writable(&self) {
        if let Some(ring) = self.ring.upgrade() {
            ring.run_unwrap();
        }
    }
}

impl UnwrapRing {
    /// 绑定明文输出缓冲、定容加密输入缓冲、引擎与事件循环调度器。
    pub fn new(
        app: EventRing,
        input_capacity: usize,
        engine: Arc<dyn TlsEngine>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let hook: Arc<dyn RingEventHandler> = Arc::new(AppBufferHook { ring: weak.clone() });
            app.triggers().register(hook.clone());
            Self {
                inner: Mutex::new(UnwrapState {
                    app,
                    encrypted: RingBuffer::new(input_capacity),
                    operating: false,
                    deferred: DeferredSlot::default(),
                }),
                engine,
                scheduler,
                pair: OnceLock::new(),
                triggers: Arc::new(EventTriggers::new()),
                app_hook: hook,
                self_weak: weak.clone(),
                closed: AtomicBool::new(false),
            }
        })
    }

    /// 绑定配对的 wrap 侧能力句柄，只允许设置一次。
    pub fn bind_pair(&self, pair: Arc<dyn DriveWrap>) {
        if self.pair.set(pair).is_err() {
            tracing::warn!("unwrap 侧重复绑定 wrap 能力句柄，保留首次绑定");
        }
    }

    /// 面向网络层的事件注册表。
    pub fn triggers(&self) -> Arc<EventTriggers> {
        Arc::clone(&self.triggers)
    }

    /// 网络字节入口。
    ///
    /// 已关闭时幂等丢弃并返回 `Stored(0)`；缓冲满返回 `Stored(0)`；
    /// 来源流结束原样上抛且不再尝试解包；存入成功后立即驱动一轮解包。
    pub fn feed(&self, src: &mut dyn Read) -> io::Result<StoreOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(StoreOutcome::Stored(0));
        }
        let outcome = self.inner.lock().encrypted.store_from(src)?;
        if let StoreOutcome::Stored(n) = outcome {
            if n > 0 {
                self.run_unwrap();
            }
        }
        Ok(outcome)
    }

    /// 驱动解包直至本轮再无可推进的工作。
    ///
    /// 延迟动作在此以循环展开：整理缓冲、重跑一轮、或驱动配对 wrap 侧，
    /// 每步之后重新执行一轮引擎调用，直到槽位为空。
    pub fn run_unwrap(&self) {
        let mut next = self.unwrap_pass();
        while let Some(action) = next {
            match action {
                PendingAction::ReUnwrap => {}
                PendingAction::DefragmentInputThenUnwrap => {
                    self.inner.lock().encrypted.defragment();
                }
                PendingAction::DefragmentOutputThenUnwrap => {
                    self.inner.lock().app.ring_mut().defragment();
                }
                PendingAction::DriveWrapSide => {
                    self.drive_pair();
                    return;
                }
                other => {
                    debug_assert!(false, "wrap-side action {other:?} leaked into unwrap engine");
                    return;
                }
            }
            next = self.unwrap_pass();
        }
    }

    /// 单轮驱动：一次引擎调用加结果分发，返回本轮排下的延迟动作。
    ///
    /// Operating 窗口横跨引擎调用与通知补发；通知在内部锁释放后补发，
    /// 处理器若同步回调 `feed`/`run_unwrap`，会因窗口仍开启而被合并为
    /// 延迟动作，绝不会嵌套出第二次引擎调用。
    fn unwrap_pass(&self) -> Option<PendingAction> {
        let fire_writable;
        let mut fire_readable = false;
        let mut drive_pair_inline = false;
        let app_triggers;
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.operating {
                state.deferred.merge_reentry(PendingAction::ReUnwrap);
                return None;
            }
            if state.encrypted.used() == 0 {
                return None;
            }
            state.operating = true;
            let was_full = state.encrypted.free() == 0;

            let input = state.encrypted.readable_region();
            let output = state.app.ring_mut().writable_region();
            match self.engine.unwrap(input, output) {
                Ok(result) => {
                    state.encrypted.consume(result.consumed);
                    state.app.ring_mut().extend(result.produced);
                    fire_readable = result.produced > 0;
                    if result.handshake == HandshakeStatus::NotHandshaking {
                        self.on_record_result(state, result);
                    } else {
                        drive_pair_inline = self.on_handshake_result(state, result);
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "解包遇到加密错误，终止本轮处理");
                }
            }

            fire_writable = was_full && state.encrypted.free() > 0;
            app_triggers = state.app.triggers();
        }

        // Operating 窗口未关：同步回调进来的触发会合并进延迟槽位。
        if drive_pair_inline {
            self.drive_pair();
        }
        if fire_readable {
            app_triggers.fire_readable();
        }
        if fire_writable {
            self.triggers.fire_writable();
        }

        let mut guard = self.inner.lock();
        guard.operating = false;
        guard.deferred.take()
    }

    /// 记录层解密路径的结果分发。
    fn on_record_result(&self, state: &mut UnwrapState, result: EngineResult) {
        match result.status {
            EngineStatus::Closed => {
                tracing::warn!("记录解密收到 CLOSED，应出现在握手路径，忽略本次结果");
            }
            EngineStatus::Ok => {
                // 输入缓冲里可能还有完整记录，延迟再跑一轮。
                state.deferred.schedule(PendingAction::ReUnwrap);
            }
            EngineStatus::BufferUnderflow => {
                let expected = self.engine.record_size_hint();
                if expected > state.encrypted.capacity() {
                    tracing::warn!(
                        expected,
                        capacity = state.encrypted.capacity(),
                        "加密输入缓冲容量不足以容纳完整记录，连接将停滞"
                    );
                } else {
                    tracing::debug!(expected, "记录尚未完整，等待更多网络数据");
                }
                if state.encrypted.fragmented() {
                    state
                        .deferred
                        .schedule(PendingAction::DefragmentInputThenUnwrap);
                }
            }
            EngineStatus::BufferOverflow => {
                if state.app.ring().fragmented() {
                    tracing::warn!("明文输出缓冲空间不足，先整理再重试");
                    state
                        .deferred
                        .schedule(PendingAction::DefragmentOutputThenUnwrap);
                } else {
                    tracing::debug!("明文输出缓冲已满且无碎片可整理，等待应用读取");
                }
            }
        }
    }

    /// 握手接收路径的结果分发；返回值表示是否需要就地驱动 wrap 侧。
    fn on_handshake_result(&self, state: &mut UnwrapState, result: EngineResult) -> bool {
        if result.status == EngineStatus::BufferUnderflow {
            tracing::warn!(
                expected = self.engine.record_size_hint(),
                "握手解包缺少完整记录"
            );
            if state.encrypted.fragmented() {
                state
                    .deferred
                    .schedule(PendingAction::DefragmentInputThenUnwrap);
            }
            return false;
        }
        match result.handshake {
            HandshakeStatus::NotHandshaking => {
                tracing::warn!("握手解包路径收到 NOT_HANDSHAKING，忽略本次结果");
                false
            }
            HandshakeStatus::Finished => {
                // 本侧握手完成，延迟驱动 wrap 侧冲刷最后一条握手消息。
                state.deferred.schedule(PendingAction::DriveWrapSide);
                false
            }
            HandshakeStatus::NeedTask => {
                self.spawn_delegated_tasks();
                false
            }
            // wrap 侧此刻应处于空闲，可以安全地就地驱动。
            HandshakeStatus::NeedWrap => true,
            HandshakeStatus::NeedUnwrap => {
                state.deferred.schedule(PendingAction::ReUnwrap);
                false
            }
        }
    }

    fn spawn_delegated_tasks(&self) {
        let unwrap_side = self.self_weak.clone();
        let resume_unwrap: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(ring) = unwrap_side.upgrade() {
                ring.run_unwrap();
            }
        });
        let resume_wrap: Box<dyn FnOnce() + Send> = match self.pair.get().cloned() {
            Some(pair) => Box::new(move || pair.drive_wrap()),
            None => {
                let fallback = self.self_weak.clone();
                Box::new(move || {
                    if let Some(ring) = fallback.upgrade() {
                        ring.run_unwrap();
                    }
                })
            }
        };
        task::drain_delegated_tasks(
            self.engine.clone(),
            self.scheduler.clone(),
            resume_wrap,
            resume_unwrap,
        );
    }

    fn drive_pair(&self) {
        match self.pair.get() {
            Some(pair) => pair.drive_wrap(),
            None => tracing::warn!("未绑定 wrap 侧能力句柄，忽略驱动请求"),
        }
    }

    /// 应用可读的明文字节数。
    pub fn bytes_available(&self) -> usize {
        self.inner.lock().app.ring().used()
    }

    /// 面向应用的容量：明文输出缓冲的容量，上游流控据此决策。
    pub fn capacity(&self) -> usize {
        self.inner.lock().app.ring().capacity()
    }

    /// 还能接纳多少原始网络字节：加密输入缓冲的剩余空间。
    pub fn accept_more(&self) -> usize {
        self.inner.lock().encrypted.free()
    }

    /// 应用读取明文，直接代理明文缓冲的写出。
    ///
    /// 读走数据后补发明文缓冲的可写事件，内部钩子顺势重试解包
    /// （可能有密文早已就绪、只等输出端腾出空间）。
    pub fn drain_to(&self, sink: &mut dyn Write, max: usize) -> io::Result<usize> {
        let (written, app_triggers) = {
            let mut guard = self.inner.lock();
            let written = guard.app.ring_mut().write_to(sink, max)?;
            (written, guard.app.triggers())
        };
        if written > 0 {
            app_triggers.fire_writable();
        }
        Ok(written)
    }

    /// 单向关闭闩：不再接受新的网络输入，已解密的明文仍可读取。
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 丢弃明文缓冲中的全部数据。
    pub fn clear(&self) {
        self.inner.lock().app.ring_mut().clear();
    }

    /// 释放明文缓冲的堆外资源（堆实现为空操作）。
    pub fn clean(&self) {
        self.inner.lock().app.ring_mut().clean();
    }

    /// 明文输出缓冲的原子交接。
    ///
    /// 仅当现缓冲为空且替换缓冲满足存储契约时成功：内部钩子从旧注册表
    /// 注销、挂到新注册表，换入新缓冲并返回旧缓冲，随后立刻驱动一轮
    /// 解包（可能有密文仍在等待输出目的地）。失败时返回类型化拒绝，
    /// 替换缓冲原样归还，内部状态不变。
    pub fn rebind(&self, replacement: EventRing) -> Result<EventRing, RebindError> {
        let old = {
            let mut guard = self.inner.lock();
            let used = guard.app.ring().used();
            if used != 0 {
                return Err(RebindError {
                    reason: RebindReason::NonEmpty { used },
                    replacement,
                });
            }
            if replacement.ring().capacity() < guard.app.ring().capacity() {
                return Err(RebindError {
                    reason: RebindReason::Incompatible {
                        detail: "replacement capacity below the bound buffer's capacity",
                    },
                    replacement,
                });
            }
            guard.app.triggers().deregister(&self.app_hook);
            replacement.triggers().register(self.app_hook.clone());
            std::mem::replace(&mut guard.app, replacement)
        };
        self.run_unwrap();
        Ok(old)
    }
}

impl DriveUnwrap for UnwrapRing {
    fn drive_unwrap(&self) {
        self.run_unwrap();
    }
}
