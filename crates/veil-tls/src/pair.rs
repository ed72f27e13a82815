use std::sync::Arc;

use veil_buffer::EventRing;

use crate::engine::TlsEngine;
use crate::resume::Scheduler;
use crate::unwrap::UnwrapRing;
use crate::wrap::WrapRing;

/// “立即驱动 wrap 侧”能力句柄。
///
/// unwrap 侧只需要配对组件的这一个操作，不需要拿到整个对象；
/// 以能力受限的 trait 对象建立配对，避免两侧互持完整引用形成所有权环。
pub trait DriveWrap: Send + Sync {
    fn drive_wrap(&self);
}

/// “立即驱动 unwrap 侧”能力句柄，wrap 侧的对称需求。
pub trait DriveUnwrap: Send + Sync {
    fn drive_unwrap(&self);
}

/// 构造一对互相配对的 unwrap/wrap 引擎。
///
/// # 契约说明（What）
/// - `app`：明文输出缓冲（应用读取端），随 unwrap 侧走；
/// - `input_capacity`：加密输入缓冲容量（网络读入端）；
/// - `plain_capacity` / `output_capacity`：wrap 侧的明文输入与密文输出容量；
/// - 两侧共享同一个引擎实例与事件循环调度器；
/// - 返回前已完成双向能力绑定，握手可以从任意一侧启动。
pub fn pair(
    app: EventRing,
    input_capacity: usize,
    plain_capacity: usize,
    output_capacity: usize,
    engine: Arc<dyn TlsEngine>,
    scheduler: Arc<dyn Scheduler>,
) -> (Arc<UnwrapRing>, Arc<WrapRing>) {
    let unwrap = UnwrapRing::new(app, input_capacity, engine.clone(), scheduler.clone());
    let wrap = WrapRing::new(plain_capacity, output_capacity, engine, scheduler);
    unwrap.bind_pair(wrap.clone());
    wrap.bind_pair(unwrap.clone());
    (unwrap, wrap)
}
