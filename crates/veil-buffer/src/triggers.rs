use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::RingBuffer;

/// 缓冲事件处理器：电平触发的“变为可读 / 变为可写”通知。
///
/// # 契约说明（What）
/// - 两类通知都是尽力而为且幂等的：状态未变化时补发一次不应产生副作用；
/// - 回调在触发方的调用栈上同步执行，处理器内部不得长时间阻塞。
pub trait RingEventHandler: Send + Sync {
    /// 缓冲出现新的可读数据。
    fn on_readable(&self);
    /// 缓冲重新出现可写空间。
    fn on_writable(&self);
}

/// 事件注册表：由缓冲持有者在状态变化后补发通知。
///
/// # 设计动机（Why）
/// - 缓冲本身不感知“谁关心水位变化”，注册表将观察者集中管理，
///   持有者在完成一轮操作后统一触发，避免在缓冲内部散落回调逻辑。
///
/// # 逻辑解析（How）
/// - 处理器列表由 `parking_lot::Mutex` 保护；触发时先快照再逐个回调，
///   确保处理器在回调中注册/注销自身不会与遍历冲突，也不会在回调期间
///   持有注册表锁。
/// - 注销按 `Arc` 指针同一性匹配，与注册时传入的句柄一一对应。
pub struct EventTriggers {
    handlers: Mutex<Vec<Arc<dyn RingEventHandler>>>,
}

impl EventTriggers {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, handler: Arc<dyn RingEventHandler>) {
        self.handlers.lock().push(handler);
    }

    pub fn deregister(&self, handler: &Arc<dyn RingEventHandler>) {
        self.handlers
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, handler));
    }

    /// 当前注册的处理器数量，供交接断言与观测使用。
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fire_readable(&self) {
        for handler in self.snapshot() {
            handler.on_readable();
        }
    }

    pub fn fire_writable(&self) {
        for handler in self.snapshot() {
            handler.on_writable();
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn RingEventHandler>> {
        self.handlers.lock().clone()
    }
}

impl Default for EventTriggers {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventTriggers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTriggers")
            .field("handlers", &self.len())
            .finish()
    }
}

/// 环形缓冲与其事件注册表的捆绑体。
///
/// 缓冲交接（handover）要求注册关系随缓冲一起换入换出，
/// 因此两者必须作为整体移动；注册表以 `Arc` 持有，便于持有者
/// 在释放内部锁之后再补发通知。
#[derive(Debug)]
pub struct EventRing {
    ring: RingBuffer,
    triggers: Arc<EventTriggers>,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            triggers: Arc::new(EventTriggers::new()),
        }
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut RingBuffer {
        &mut self.ring
    }

    pub fn triggers(&self) -> Arc<EventTriggers> {
        Arc::clone(&self.triggers)
    }
}
