/// 延迟续延动作：一轮引擎驱动结束后紧接着执行的下一步。
///
/// # 设计背景（Why）
/// - 引擎驱动过程中产生的“再试一次”诉求不能在当前调用栈内递归执行，
///   否则突发输入会造成无界调用深度；以带标签的枚举取代闭包队列，
///   使“至多一个待执行动作”成为类型层面的事实（字段要么空要么持有
///   一个变体，绝不会是列表）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingAction {
    /// 再跑一轮解包（输入缓冲可能还有完整记录）。
    ReUnwrap,
    /// 先整理加密输入缓冲，再跑一轮解包。
    DefragmentInputThenUnwrap,
    /// 先整理明文输出缓冲，再跑一轮解包。
    DefragmentOutputThenUnwrap,
    /// 驱动配对的 wrap 侧（握手完成后冲刷最后一条握手消息）。
    DriveWrapSide,
    /// 再跑一轮封包（明文输入可能还有剩余）。
    ReWrap,
    /// 先整理密文输出缓冲，再跑一轮封包。
    DefragmentOutputThenWrap,
    /// 驱动配对的 unwrap 侧（封包握手需要接收对端数据）。
    DriveUnwrapSide,
}

/// 单槽位延迟队列。
///
/// 每轮驱动的各分支至多入队一个动作；槽位已占用时再次 `schedule`
/// 属于控制纪律被破坏，以 `debug_assert` 拦截。驱动窗口期间到达的
/// 再入触发通过 `merge_reentry` 合并：槽位已有动作时直接复用
/// （所有变体最终都会重跑一轮驱动），保持“至多一个”不变量。
#[derive(Debug, Default)]
pub(crate) struct DeferredSlot {
    slot: Option<PendingAction>,
}

impl DeferredSlot {
    pub(crate) fn schedule(&mut self, action: PendingAction) {
        debug_assert!(
            self.slot.is_none(),
            "deferred slot already occupied by {:?}",
            self.slot
        );
        self.slot = Some(action);
    }

    pub(crate) fn merge_reentry(&mut self, action: PendingAction) {
        if self.slot.is_none() {
            self.slot = Some(action);
        }
    }

    pub(crate) fn take(&mut self) -> Option<PendingAction> {
        self.slot.take()
    }
}

/// 事件循环续延入口：后台线程或延迟逻辑把动作交还单线程执行环境。
///
/// 构造适配器时由事件循环注入；`schedule` 必须保证动作最终在事件循环
/// 线程上执行，绝不允许在调用线程上就地运行。
pub trait Scheduler: Send + Sync {
    fn schedule(&self, action: Box<dyn FnOnce() + Send>);
}
