//! `unwrap_contract` 集成测试：聚焦解包引擎的非阻塞契约。
//!
//! # 测试总览（Why）
//! - 以脚本化的 [`MockEngine`] 精确控制引擎的四态/五态信号，
//!   覆盖关闭幂等、欠载收敛、背压信号、缓冲交接与委托任务恢复；
//! - 引擎探针记录调用是否重叠，验证“同一实例上引擎调用绝不嵌套”，
//!   即使可写通知在一轮驱动内部同步回调 `feed` 也是如此。

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use veil_buffer::{EventRing, RingEventHandler, StoreOutcome};
use veil_tls::{
    DelegatedTask, EngineError, EngineResult, EngineStatus, HandshakeStatus, RebindReason,
    Scheduler, TlsEngine, UnwrapRing, pair,
};

type Behavior = Box<dyn FnMut(&[u8], &mut [u8]) -> Result<EngineResult, EngineError> + Send>;

fn result(
    status: EngineStatus,
    handshake: HandshakeStatus,
    consumed: usize,
    produced: usize,
) -> EngineResult {
    EngineResult {
        status,
        handshake,
        consumed,
        produced,
    }
}

/// 脚本化引擎：行为由闭包决定，并以探针记录调用重叠。
struct MockEngine {
    unwrap_behavior: Mutex<Behavior>,
    wrap_behavior: Mutex<Behavior>,
    status: Mutex<HandshakeStatus>,
    tasks: Mutex<VecDeque<DelegatedTask>>,
    unwrap_calls: AtomicUsize,
    wrap_calls: AtomicUsize,
    in_call: AtomicBool,
    overlapped: AtomicBool,
}

impl MockEngine {
    fn new(unwrap_behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            unwrap_behavior: Mutex::new(unwrap_behavior),
            wrap_behavior: Mutex::new(Box::new(|input, _output| {
                Ok(result(
                    EngineStatus::Ok,
                    HandshakeStatus::NotHandshaking,
                    input.len(),
                    0,
                ))
            })),
            status: Mutex::new(HandshakeStatus::NotHandshaking),
            tasks: Mutex::new(VecDeque::new()),
            unwrap_calls: AtomicUsize::new(0),
            wrap_calls: AtomicUsize::new(0),
            in_call: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        })
    }

    fn set_wrap_behavior(&self, behavior: Behavior) {
        *self.wrap_behavior.lock().expect("mutex poisoned") = behavior;
    }

    fn set_status(&self, status: HandshakeStatus) {
        *self.status.lock().expect("mutex poisoned") = status;
    }

    fn push_task(&self, task: DelegatedTask) {
        self.tasks.lock().expect("mutex poisoned").push_back(task);
    }

    fn enter(&self) {
        if self.in_call.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
    }

    fn exit(&self) {
        self.in_call.store(false, Ordering::SeqCst);
    }
}

impl TlsEngine for MockEngine {
    fn unwrap(&self, input: &[u8], output: &mut [u8]) -> Result<EngineResult, EngineError> {
        self.enter();
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = (self.unwrap_behavior.lock().expect("mutex poisoned"))(input, output);
        self.exit();
        outcome
    }

    fn wrap(&self, input: &[u8], output: &mut [u8]) -> Result<EngineResult, EngineError> {
        self.enter();
        self.wrap_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = (self.wrap_behavior.lock().expect("mutex poisoned"))(input, output);
        self.exit();
        outcome
    }

    fn handshake_status(&self) -> HandshakeStatus {
        *self.status.lock().expect("mutex poisoned")
    }

    fn next_delegated_task(&self) -> Option<DelegatedTask> {
        self.tasks.lock().expect("mutex poisoned").pop_front()
    }

    fn record_size_hint(&self) -> usize {
        64
    }
}

/// 把动作排队、由测试线程扮演事件循环逐个执行的调度器。
#[derive(Default)]
struct RecordingScheduler {
    queue: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl RecordingScheduler {
    fn pending(&self) -> usize {
        self.queue.lock().expect("mutex poisoned").len()
    }

    fn drain(&self) {
        loop {
            let Some(action) = self.queue.lock().expect("mutex poisoned").pop() else {
                return;
            };
            action();
        }
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, action: Box<dyn FnOnce() + Send>) {
        self.queue.lock().expect("mutex poisoned").push(action);
    }
}

fn noop_scheduler() -> Arc<RecordingScheduler> {
    Arc::new(RecordingScheduler::default())
}

#[derive(Default)]
struct CountingHandler {
    readable: AtomicUsize,
    writable: AtomicUsize,
}

impl RingEventHandler for CountingHandler {
    fn on_readable(&self) {
        self.readable.fetch_add(1, Ordering::SeqCst);
    }

    fn on_writable(&self) {
        self.writable.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn feed_after_close_is_idempotent_noop() {
    let engine = MockEngine::new(Box::new(|input, _| {
        Ok(result(
            EngineStatus::Ok,
            HandshakeStatus::NotHandshaking,
            input.len(),
            0,
        ))
    }));
    let ring = UnwrapRing::new(EventRing::new(8), 8, engine.clone(), noop_scheduler());

    ring.close();
    let mut src: &[u8] = b"ciphertext";
    let outcome = ring.feed(&mut src).expect("关闭后的 feed 不应报错");
    assert_eq!(outcome, StoreOutcome::Stored(0));
    assert_eq!(ring.accept_more(), 8, "关闭后的 feed 不得触碰输入缓冲");
    assert_eq!(engine.unwrap_calls.load(Ordering::SeqCst), 0);

    // 再次调用同样幂等。
    let outcome = ring.feed(&mut src).expect("关闭后的 feed 不应报错");
    assert_eq!(outcome, StoreOutcome::Stored(0));
}

#[test]
fn end_of_stream_propagates_without_unwrapping() {
    let engine = MockEngine::new(Box::new(|_, _| {
        panic!("流结束时不应调用引擎");
    }));
    let ring = UnwrapRing::new(EventRing::new(8), 8, engine, noop_scheduler());

    let mut src: &[u8] = b"";
    let outcome = ring.feed(&mut src).expect("EOF 不是 IO 错误");
    assert_eq!(outcome, StoreOutcome::EndOfStream);
}

/// 在一轮驱动内部同步回调 `feed` 的“可写通知风暴”处理器。
struct StormHandler {
    ring: Mutex<Option<Weak<UnwrapRing>>>,
    extra_fed: AtomicBool,
}

impl RingEventHandler for StormHandler {
    fn on_readable(&self) {}

    fn on_writable(&self) {
        if self.extra_fed.swap(true, Ordering::SeqCst) {
            return;
        }
        let upgraded = self
            .ring
            .lock()
            .expect("mutex poisoned")
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(ring) = upgraded {
            let mut src: &[u8] = b"more";
            ring.feed(&mut src).expect("风暴回调中的 feed 不应报错");
        }
    }
}

#[test]
fn reentrant_trigger_storm_never_overlaps_engine_calls() {
    let engine = MockEngine::new(Box::new(|input, _| {
        let consumed = input.len().min(4);
        Ok(result(
            EngineStatus::Ok,
            HandshakeStatus::NotHandshaking,
            consumed,
            0,
        ))
    }));
    let ring = UnwrapRing::new(EventRing::new(8), 8, engine.clone(), noop_scheduler());
    let storm = Arc::new(StormHandler {
        ring: Mutex::new(Some(Arc::downgrade(&ring))),
        extra_fed: AtomicBool::new(false),
    });
    ring.triggers().register(storm.clone());

    let mut src: &[u8] = b"12345678";
    let outcome = ring.feed(&mut src).expect("feed 不应失败");
    assert_eq!(outcome, StoreOutcome::Stored(8));

    assert!(storm.extra_fed.load(Ordering::SeqCst), "风暴回调应被触发");
    assert!(
        !engine.overlapped.load(Ordering::SeqCst),
        "引擎调用绝不允许重叠"
    );
    assert_eq!(ring.accept_more(), 8, "风暴结束后全部密文都应被消费");
}

#[test]
fn underflow_converges_on_byte_at_a_time_input() {
    const RECORD: &[u8] = b"hello";
    let engine = MockEngine::new(Box::new(|input, output| {
        if input.len() < RECORD.len() {
            return Ok(result(
                EngineStatus::BufferUnderflow,
                HandshakeStatus::NotHandshaking,
                0,
                0,
            ));
        }
        output[..RECORD.len()].copy_from_slice(b"HELLO");
        Ok(result(
            EngineStatus::Ok,
            HandshakeStatus::NotHandshaking,
            RECORD.len(),
            RECORD.len(),
        ))
    }));
    let ring = UnwrapRing::new(EventRing::new(8), 8, engine, noop_scheduler());

    for byte in RECORD {
        let mut src: &[u8] = std::slice::from_ref(byte);
        ring.feed(&mut src).expect("逐字节 feed 不应失败");
    }

    assert_eq!(ring.bytes_available(), RECORD.len());
    let mut out = Vec::new();
    ring.drain_to(&mut out, usize::MAX).expect("读取不应失败");
    assert_eq!(out, b"HELLO");
}

#[test]
fn writable_fires_exactly_once_on_full_to_nonfull_transition() {
    let engine = MockEngine::new(Box::new(|input, _| {
        Ok(result(
            EngineStatus::Ok,
            HandshakeStatus::NotHandshaking,
            input.len().min(2),
            0,
        ))
    }));
    let ring = UnwrapRing::new(EventRing::new(8), 4, engine, noop_scheduler());
    let counter = Arc::new(CountingHandler::default());
    ring.triggers().register(counter.clone());

    let mut src: &[u8] = b"full";
    ring.feed(&mut src).expect("feed 不应失败");
    assert_eq!(
        counter.writable.load(Ordering::SeqCst),
        1,
        "满 → 非满 转换只补发一次可写通知"
    );
}

#[test]
fn writable_never_fires_when_buffer_was_not_full() {
    let engine = MockEngine::new(Box::new(|input, _| {
        Ok(result(
            EngineStatus::Ok,
            HandshakeStatus::NotHandshaking,
            input.len(),
            0,
        ))
    }));
    let ring = UnwrapRing::new(EventRing::new(8), 4, engine, noop_scheduler());
    let counter = Arc::new(CountingHandler::default());
    ring.triggers().register(counter.clone());

    let mut src: &[u8] = b"ab";
    ring.feed(&mut src).expect("feed 不应失败");
    assert_eq!(counter.writable.load(Ordering::SeqCst), 0);
}

#[test]
fn rebind_rejected_on_nonempty_buffer_and_succeeds_after_drain() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_probe = calls.clone();
    let engine = MockEngine::new(Box::new(move |input, output| {
        let call = calls_probe.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            output[..2].copy_from_slice(b"AB");
            return Ok(result(
                EngineStatus::Ok,
                HandshakeStatus::NotHandshaking,
                0,
                2,
            ));
        }
        if output.len() >= 8 {
            output[..6].copy_from_slice(b"SECRET");
            return Ok(result(
                EngineStatus::Ok,
                HandshakeStatus::NotHandshaking,
                input.len(),
                6,
            ));
        }
        Ok(result(
            EngineStatus::BufferOverflow,
            HandshakeStatus::NotHandshaking,
            0,
            0,
        ))
    }));
    let ring = UnwrapRing::new(EventRing::new(4), 8, engine, noop_scheduler());

    let mut src: &[u8] = b"ctxt";
    ring.feed(&mut src).expect("feed 不应失败");
    assert_eq!(ring.bytes_available(), 2);

    // 明文未读完，交接必须被类型化拒绝，内部状态保持不变。
    let rejected = ring.rebind(EventRing::new(8)).expect_err("非空缓冲不得交接");
    assert_eq!(rejected.reason, RebindReason::NonEmpty { used: 2 });
    assert_eq!(rejected.replacement.ring().capacity(), 8, "替换缓冲原样归还");
    assert_eq!(ring.bytes_available(), 2);

    let mut out = Vec::new();
    ring.drain_to(&mut out, usize::MAX).expect("读取不应失败");
    assert_eq!(out, b"AB");
    assert_eq!(ring.bytes_available(), 0);

    // 容量低于现缓冲的替换违反存储契约。
    let incompatible = ring.rebind(EventRing::new(2)).expect_err("容量不足不得交接");
    assert!(matches!(
        incompatible.reason,
        RebindReason::Incompatible { .. }
    ));

    // 空缓冲 + 合格替换：交接成功，滞留的密文随即被解包进新缓冲。
    let old = ring.rebind(EventRing::new(8)).expect("空缓冲交接应成功");
    assert_eq!(old.ring().capacity(), 4);
    assert!(old.triggers().is_empty(), "内部钩子应已从旧缓冲注销");

    assert_eq!(ring.bytes_available(), 6);
    let mut secret = Vec::new();
    ring.drain_to(&mut secret, usize::MAX).expect("读取不应失败");
    assert_eq!(secret, b"SECRET");
    assert_eq!(ring.accept_more(), 8, "滞留密文应被全部消费");
}

#[test]
fn crypto_failure_logs_and_stalls_without_closing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_probe = calls.clone();
    let engine = MockEngine::new(Box::new(move |input, _| {
        if calls_probe.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(EngineError::Crypto {
                reason: "bad record mac".into(),
            });
        }
        Ok(result(
            EngineStatus::Ok,
            HandshakeStatus::NotHandshaking,
            input.len(),
            0,
        ))
    }));
    let ring = UnwrapRing::new(EventRing::new(8), 8, engine, noop_scheduler());

    let mut src: &[u8] = b"evil";
    let outcome = ring.feed(&mut src).expect("加密错误不应上抛为 IO 错误");
    assert_eq!(outcome, StoreOutcome::Stored(4));
    assert!(!ring.is_closed(), "加密失败不自动关闭连接，由调用方决策");
    assert_eq!(ring.accept_more(), 4, "出错的密文保留在缓冲中");

    // 连接仍可继续驱动。
    let mut more: &[u8] = b"ok";
    ring.feed(&mut more).expect("后续 feed 不应失败");
    assert_eq!(ring.accept_more(), 8);
}

#[test]
fn need_wrap_drives_pair_synchronously() {
    let engine = MockEngine::new(Box::new(|input, _| {
        Ok(result(
            EngineStatus::Ok,
            HandshakeStatus::NeedWrap,
            input.len(),
            0,
        ))
    }));
    engine.set_status(HandshakeStatus::NeedWrap);
    engine.set_wrap_behavior(Box::new(|_, output| {
        output[..2].copy_from_slice(b"HS");
        Ok(result(EngineStatus::Ok, HandshakeStatus::NeedUnwrap, 0, 2))
    }));

    let scheduler = noop_scheduler();
    let (unwrap_ring, wrap_ring) = pair(EventRing::new(8), 8, 8, 8, engine.clone(), scheduler);

    let mut src: &[u8] = b"flight";
    unwrap_ring.feed(&mut src).expect("feed 不应失败");

    // NEED_WRAP 在 feed 的同步调用栈内就地驱动 wrap 侧。
    assert!(engine.wrap_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(wrap_ring.bytes_pending(), 2);
    assert!(!engine.overlapped.load(Ordering::SeqCst));
}

#[test]
fn need_task_drains_off_thread_and_resumes_via_scheduler() {
    let engine = MockEngine::new(Box::new(|input, _| {
        Ok(result(
            EngineStatus::Ok,
            HandshakeStatus::NeedTask,
            input.len(),
            0,
        ))
    }));
    let task_thread: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));
    let task_probe = task_thread.clone();
    let engine_probe = engine.clone();
    engine.push_task(Box::new(move || {
        *task_probe.lock().expect("mutex poisoned") = Some(thread::current().id());
        engine_probe.set_status(HandshakeStatus::NeedUnwrap);
    }));

    let scheduler = Arc::new(RecordingScheduler::default());
    let ring = UnwrapRing::new(EventRing::new(8), 8, engine.clone(), scheduler.clone());

    let mut src: &[u8] = b"kex";
    ring.feed(&mut src).expect("feed 不应失败");

    // 恢复动作必须经调度器交还事件循环，而不是在工作线程上执行。
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.pending() == 0 {
        assert!(Instant::now() < deadline, "等待后台任务恢复超时");
        thread::sleep(Duration::from_millis(1));
    }

    let recorded = task_thread
        .lock()
        .expect("mutex poisoned")
        .expect("委托任务应已执行");
    assert_ne!(recorded, thread::current().id(), "委托任务必须跑在后台线程");

    scheduler.drain();
    assert_eq!(engine.handshake_status(), HandshakeStatus::NeedUnwrap);
    assert!(!engine.overlapped.load(Ordering::SeqCst));
}

/// 结构性容量不足：引擎宣告的记录尺寸超过输入缓冲容量时只告警，
/// 数据保持原样等待上层拆链。
#[test]
fn structural_capacity_shortfall_stalls_without_loss() {
    let engine = MockEngine::new(Box::new(|_, _| {
        Ok(result(
            EngineStatus::BufferUnderflow,
            HandshakeStatus::NotHandshaking,
            0,
            0,
        ))
    }));
    // record_size_hint = 64 > 输入容量 8。
    let ring = UnwrapRing::new(EventRing::new(8), 8, engine, noop_scheduler());

    let mut src: &[u8] = b"tiny";
    ring.feed(&mut src).expect("feed 不应失败");
    assert_eq!(ring.accept_more(), 4, "欠载数据原样保留");
    assert_eq!(ring.bytes_available(), 0);

    let mut ignored = io::sink();
    assert_eq!(ring.drain_to(&mut ignored, usize::MAX).expect("空读不报错"), 0);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    /// 玩具记录编解码：`[长度 u8][载荷]`，只看连续可读区间。
    /// 记录被缓冲回绕截断时报告欠载，由整理 + 重试路径凑齐。
    fn length_prefixed_engine() -> Arc<MockEngine> {
        MockEngine::new(Box::new(|input, output| {
            let Some((&len, rest)) = input.split_first() else {
                return Ok(result(
                    EngineStatus::BufferUnderflow,
                    HandshakeStatus::NotHandshaking,
                    0,
                    0,
                ));
            };
            let len = len as usize;
            if rest.len() < len {
                return Ok(result(
                    EngineStatus::BufferUnderflow,
                    HandshakeStatus::NotHandshaking,
                    0,
                    0,
                ));
            }
            if output.len() < len {
                return Ok(result(
                    EngineStatus::BufferOverflow,
                    HandshakeStatus::NotHandshaking,
                    0,
                    0,
                ));
            }
            output[..len].copy_from_slice(&rest[..len]);
            Ok(result(
                EngineStatus::Ok,
                HandshakeStatus::NotHandshaking,
                1 + len,
                len,
            ))
        }))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// 任意切分的密文流经过管道后，明文必须逐字节还原，
        /// 且任何切分方式都不得让管道停滞。
        #[test]
        fn chunked_ciphertext_reassembles_plaintext(
            records in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32usize), 1..16),
            cuts in prop::collection::vec(1usize..7, 1..32),
        ) {
            let engine = length_prefixed_engine();
            let ring = UnwrapRing::new(EventRing::new(64), 64, engine.clone(), noop_scheduler());

            let wire: Vec<u8> = records
                .iter()
                .flat_map(|record| {
                    let mut framed = Vec::with_capacity(record.len() + 1);
                    framed.push(record.len() as u8);
                    framed.extend_from_slice(record);
                    framed
                })
                .collect();
            let expected: Vec<u8> = records.concat();

            let mut collected = Vec::new();
            let mut cursor: &[u8] = &wire;
            let mut cut = cuts.iter().cycle();
            let mut budget = wire.len() * 4 + 16;
            while !cursor.is_empty() {
                prop_assert!(budget > 0, "管道停滞，密文未被消化完");
                budget -= 1;
                let step = cut.next().copied().unwrap_or(1).min(cursor.len());
                let mut src = &cursor[..step];
                let outcome = ring.feed(&mut src).expect("feed 不应失败");
                let StoreOutcome::Stored(stored) = outcome else {
                    prop_assert!(false, "非空来源不应报告流结束");
                    unreachable!();
                };
                cursor = &cursor[stored..];
                ring.drain_to(&mut collected, usize::MAX).expect("读取不应失败");
            }
            loop {
                let n = ring.drain_to(&mut collected, usize::MAX).expect("读取不应失败");
                if n == 0 {
                    break;
                }
            }

            prop_assert_eq!(collected, expected);
            prop_assert!(!engine.overlapped.load(Ordering::SeqCst));
        }
    }
}

