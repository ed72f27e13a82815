use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use veil_buffer::{EventTriggers, RingBuffer, StoreOutcome};

use crate::engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
use crate::pair::{DriveUnwrap, DriveWrap};
use crate::resume::{DeferredSlot, PendingAction, Scheduler};
use crate::task;

/// 封包引擎：加密路径与握手发送半边，unwrap 侧的对称组件。
///
/// # 意图（Why）
/// - 应用写入的明文经引擎封包为密文后交给网络发送；握手期即使没有
///   明文输入，引擎也可能需要产出握手消息，因此驱动前提与 unwrap 侧
///   不同：明文有数据，或引擎正处于握手之中。
///
/// # 逻辑（How）
/// - 与 unwrap 侧共用同一套 Operating / 单槽位延迟 / 调度器恢复纪律；
/// - 面向网络的通知：可读 = 有密文待发送，可写 = 明文输入缓冲重新
///   有空间（应用背压解除）；
/// - 握手需要接收数据时经延迟动作驱动配对的 unwrap 侧。
pub struct WrapRing {
    inner: Mutex<WrapState>,
    engine: Arc<dyn TlsEngine>,
    scheduler: Arc<dyn Scheduler>,
    pair: OnceLock<Arc<dyn DriveUnwrap>>,
    triggers: Arc<EventTriggers>,
    self_weak: Weak<WrapRing>,
    closed: AtomicBool,
}

struct WrapState {
    /// 应用写入的明文（封包输入）。
    plain: RingBuffer,
    /// 待网络发送的密文（封包输出）。
    encrypted: RingBuffer,
    operating: bool,
    deferred: DeferredSlot,
}

impl WrapRing {
    pub fn new(
        plain_capacity: usize,
        output_capacity: usize,
        engine: Arc<dyn TlsEngine>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(WrapState {
                plain: RingBuffer::new(plain_capacity),
                encrypted: RingBuffer::new(output_capacity),
                operating: false,
                deferred: DeferredSlot::default(),
            }),
            engine,
            scheduler,
            pair: OnceLock::new(),
            triggers: Arc::new(EventTriggers::new()),
            self_weak: weak.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// 绑定配对的 unwrap 侧能力句柄，只允许设置一次。
    pub fn bind_pair(&self, pair: Arc<dyn DriveUnwrap>) {
        if self.pair.set(pair).is_err() {
            tracing::warn!("wrap 侧重复绑定 unwrap 能力句柄，保留首次绑定");
        }
    }

    /// 面向网络层的事件注册表。
    pub fn triggers(&self) -> Arc<EventTriggers> {
        Arc::clone(&self.triggers)
    }

    /// 应用明文入口；关闭后幂等丢弃。
    pub fn feed(&self, src: &mut dyn Read) -> io::Result<StoreOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(StoreOutcome::Stored(0));
        }
        let outcome = self.inner.lock().plain.store_from(src)?;
        if let StoreOutcome::Stored(n) = outcome {
            if n > 0 {
                self.run_wrap();
            }
        }
        Ok(outcome)
    }

    /// 网络层取走密文；腾出空间后顺势重试封包（可能有明文或握手
    /// 消息在等待输出空间）。
    pub fn drain_to(&self, sink: &mut dyn Write, max: usize) -> io::Result<usize> {
        let written = self.inner.lock().encrypted.write_to(sink, max)?;
        if written > 0 {
            self.run_wrap();
        }
        Ok(written)
    }

    /// 待发送的密文字节数。
    pub fn bytes_pending(&self) -> usize {
        self.inner.lock().encrypted.used()
    }

    /// 应用还能写入多少明文。
    pub fn accept_more(&self) -> usize {
        self.inner.lock().plain.free()
    }

    /// 面向应用的容量：明文输入缓冲的容量。
    pub fn capacity(&self) -> usize {
        self.inner.lock().plain.capacity()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 驱动封包直至本轮再无可推进的工作。
    pub fn run_wrap(&self) {
        let mut next = self.wrap_pass();
        while let Some(action) = next {
            match action {
                PendingAction::ReWrap => {}
                PendingAction::DefragmentOutputThenWrap => {
                    self.inner.lock().encrypted.defragment();
                }
                PendingAction::DriveUnwrapSide => {
                    self.drive_pair();
                    return;
                }
                other => {
                    debug_assert!(false, "unwrap-side action {other:?} leaked into wrap engine");
                    return;
                }
            }
            next = self.wrap_pass();
        }
    }

    /// 单轮驱动：一次引擎调用加结果分发，返回本轮排下的延迟动作。
    fn wrap_pass(&self) -> Option<PendingAction> {
        let fire_writable;
        let mut fire_readable = false;
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.operating {
                state.deferred.merge_reentry(PendingAction::ReWrap);
                return None;
            }
            // 握手期引擎可以从空输入产出握手消息，仅当既无明文也不在
            // 握手之中时才真正无事可做。
            if state.plain.used() == 0
                && self.engine.handshake_status() == HandshakeStatus::NotHandshaking
            {
                return None;
            }
            state.operating = true;
            let was_full = state.plain.free() == 0;

            let input = state.plain.readable_region();
            let output = state.encrypted.writable_region();
            match self.engine.wrap(input, output) {
                Ok(result) => {
                    state.plain.consume(result.consumed);
                    state.encrypted.extend(result.produced);
                    fire_readable = result.produced > 0;
                    if result.handshake == HandshakeStatus::NotHandshaking {
                        self.on_record_result(state, result);
                    } else {
                        self.on_handshake_result(state, result);
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "封包遇到加密错误，终止本轮处理");
                }
            }

            fire_writable = was_full && state.plain.free() > 0;
        }

        if fire_readable {
            self.triggers.fire_readable();
        }
        if fire_writable {
            self.triggers.fire_writable();
        }

        let mut guard = self.inner.lock();
        guard.operating = false;
        guard.deferred.take()
    }

    /// 记录层封包路径的结果分发。
    fn on_record_result(&self, state: &mut WrapState, result: EngineResult) {
        match result.status {
            EngineStatus::Closed => {
                tracing::warn!("记录封包收到 CLOSED，忽略本次结果");
            }
            EngineStatus::Ok => {
                // 明文缓冲可能还有剩余，延迟再跑一轮。
                state.deferred.schedule(PendingAction::ReWrap);
            }
            EngineStatus::BufferUnderflow => {
                tracing::debug!("无完整明文单元可封包，等待应用写入");
            }
            EngineStatus::BufferOverflow => {
                if state.encrypted.fragmented() {
                    state
                        .deferred
                        .schedule(PendingAction::DefragmentOutputThenWrap);
                } else {
                    tracing::debug!("密文输出缓冲已满且无碎片可整理，等待网络发送");
                }
            }
        }
    }

    /// 握手发送路径的结果分发。
    fn on_handshake_result(&self, state: &mut WrapState, result: EngineResult) {
        if result.status == EngineStatus::BufferOverflow {
            if state.encrypted.fragmented() {
                state
                    .deferred
                    .schedule(PendingAction::DefragmentOutputThenWrap);
            } else {
                tracing::debug!("握手消息等待密文输出空间，待网络发送后重试");
            }
            return;
        }
        if result.status == EngineStatus::BufferUnderflow {
            tracing::warn!("握手封包收到 BUFFER_UNDERFLOW，忽略本次结果");
            return;
        }
        match result.handshake {
            HandshakeStatus::NotHandshaking => {
                tracing::warn!("握手封包路径收到 NOT_HANDSHAKING，忽略本次结果");
            }
            HandshakeStatus::Finished => {
                // 握手完成，冲刷等候的应用明文。
                state.deferred.schedule(PendingAction::ReWrap);
            }
            HandshakeStatus::NeedTask => self.spawn_delegated_tasks(),
            HandshakeStatus::NeedWrap => {
                state.deferred.schedule(PendingAction::ReWrap);
            }
            HandshakeStatus::NeedUnwrap => {
                state.deferred.schedule(PendingAction::DriveUnwrapSide);
            }
        }
    }

    fn spawn_delegated_tasks(&self) {
        let wrap_side = self.self_weak.clone();
        let resume_wrap: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(ring) = wrap_side.upgrade() {
                ring.run_wrap();
            }
        });
        let resume_unwrap: Box<dyn FnOnce() + Send> = match self.pair.get().cloned() {
            Some(pair) => Box::new(move || pair.drive_unwrap()),
            None => {
                let fallback = self.self_weak.clone();
                Box::new(move || {
                    if let Some(ring) = fallback.upgrade() {
                        ring.run_wrap();
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
            Some(pair) => pair.drive_unwrap(),
            None => tracing::warn!("未绑定 unwrap 侧能力句柄，忽略驱动请求"),
        }
    }
}

impl DriveWrap for WrapRing {
    fn drive_wrap(&self) {
        self.run_wrap();
    }
}
