use core::fmt;
use std::io::{self, Read, Write};

/// `store_from` 单次调用的结果。
///
/// # 契约说明（What）
/// - `Stored(0)` 表示缓冲没有剩余空间或来源暂时无数据，均不是错误；
/// - `EndOfStream` 仅在本次调用未存入任何字节且来源直接返回流结束时出现，
///   对应连接对端关闭，由调用方决定拆链时机。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// 本次实际存入的字节数。
    Stored(usize),
    /// 来源已经到达流末尾，未存入任何字节。
    EndOfStream,
}

/// 定容字节环形缓冲。
///
/// # 设计背景（Why）
/// - 网络读入与引擎消费共用一块缓冲时，读写两侧的进度天然不同步，
///   环形游标避免了每次消费后整体搬移数据。
/// - 引擎（TLS 记录层状态机）只接受连续内存区间，因此缓冲额外暴露
///   `readable_region`/`writable_region` 零拷贝窗口，以及仅在窗口之外
///   才允许执行的 `defragment`。
///
/// # 逻辑解析（How）
/// - `start` 为读游标，`used` 为当前占用量，写位置由二者推导，
///   恒有 `used + free == capacity`。
/// - 零拷贝窗口只返回第一段连续区间；当占用区跨越存储末尾时，
///   窗口短于 `used()`，此时 `fragmented()` 为真，整理后窗口恢复完整。
/// - 借用检查器静态保证窗口存活期间无法调用 `defragment`，
///   对应“零拷贝访问期间禁止整理”的约束。
///
/// # 契约说明（What）
/// - `consume`/`extend` 的推进量不得超过对应窗口长度，越界属于调用方缺陷，
///   以 `debug_assert` 拦截；
/// - 占用量归零时读游标复位到 0，使空缓冲永远无碎片。
pub struct RingBuffer {
    storage: Box<[u8]>,
    start: usize,
    used: usize,
}

impl RingBuffer {
    /// 分配一块容量固定的缓冲，容量必须为正。
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.used
    }

    fn write_pos(&self) -> usize {
        (self.start + self.used) % self.capacity()
    }

    /// 第一段连续可读区间；占用区跨越末尾时短于 `used()`。
    pub fn readable_region(&self) -> &[u8] {
        if self.used == 0 {
            return &[];
        }
        let end = (self.start + self.used).min(self.capacity());
        &self.storage[self.start..end]
    }

    /// 第一段连续可写区间；空闲区跨越末尾时短于 `free()`。
    pub fn writable_region(&mut self) -> &mut [u8] {
        if self.free() == 0 {
            return &mut [];
        }
        let wpos = self.write_pos();
        let end = if wpos < self.start {
            self.start
        } else {
            self.capacity()
        };
        &mut self.storage[wpos..end]
    }

    /// 读游标前移 `n` 字节，`n` 不得超过当前可读区间长度。
    pub fn consume(&mut self, n: usize) {
        debug_assert!(
            n <= self.readable_region().len(),
            "consume beyond the contiguous readable region"
        );
        self.start = (self.start + n) % self.capacity();
        self.used -= n;
        if self.used == 0 {
            self.start = 0;
        }
    }

    /// 写游标前移 `n` 字节，声明零拷贝窗口内新写入的数据。
    pub fn extend(&mut self, n: usize) {
        debug_assert!(n <= self.free(), "extend beyond free space");
        self.used += n;
    }

    /// 占用字节是否未从存储起点开始，即整理是否会改变布局。
    pub fn fragmented(&self) -> bool {
        self.used > 0 && self.start != 0
    }

    /// 将占用字节压缩到存储起点，数据无损，使可读与可写区间都恢复连续。
    pub fn defragment(&mut self) {
        if self.start == 0 {
            return;
        }
        self.storage.rotate_left(self.start);
        self.start = 0;
    }

    /// 从来源批量读入，至多填满空闲空间。
    ///
    /// - 缓冲已满时不触碰来源，直接返回 `Stored(0)`；
    /// - 来源首次即返回 0 视为流结束；已存入部分数据后返回 0 则
    ///   先提交已存入量，流结束留待下一次调用观测；
    /// - `WouldBlock` 表示非阻塞来源暂时无数据，同样提交已存入量。
    pub fn store_from(&mut self, src: &mut dyn Read) -> io::Result<StoreOutcome> {
        if self.free() == 0 {
            return Ok(StoreOutcome::Stored(0));
        }
        let mut total = 0usize;
        while self.free() > 0 {
            let region = self.writable_region();
            debug_assert!(!region.is_empty());
            match src.read(region) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(StoreOutcome::EndOfStream);
                    }
                    break;
                }
                Ok(n) => {
                    let partial = n < region.len();
                    self.extend(n);
                    total += n;
                    if partial {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(StoreOutcome::Stored(total))
    }

    /// 向接收端批量写出，至多 `max` 字节，返回实际写出量。
    pub fn write_to(&mut self, sink: &mut dyn Write, max: usize) -> io::Result<usize> {
        let mut total = 0usize;
        while total < max && self.used > 0 {
            let budget = max - total;
            let region = self.readable_region();
            let len = region.len().min(budget);
            match sink.write(&region[..len]) {
                Ok(0) => break,
                Ok(n) => {
                    self.consume(n);
                    total += n;
                    if n < len {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// 直接存入一段切片，返回实际存入量，测试与回环场景的便捷入口。
    pub fn store_slice(&mut self, src: &[u8]) -> usize {
        let mut stored = 0usize;
        while stored < src.len() && self.free() > 0 {
            let region = self.writable_region();
            let len = region.len().min(src.len() - stored);
            region[..len].copy_from_slice(&src[stored..stored + len]);
            self.extend(len);
            stored += len;
        }
        stored
    }

    /// 丢弃全部缓冲数据。
    pub fn clear(&mut self) {
        self.start = 0;
        self.used = 0;
    }

    /// 释放堆外资源。当前实现基于堆内存，无需额外动作，
    /// 保留该入口以对齐直接缓冲实现的生命周期约定。
    pub fn clean(&mut self) {}
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("start", &self.start)
            .field("used", &self.used)
            .finish()
    }
}
