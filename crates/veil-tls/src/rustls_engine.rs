use std::io::{self, Read, Write};

use parking_lot::Mutex;
use rustls::{ClientConnection, Connection, ServerConnection};

use crate::engine::{DelegatedTask, EngineError, EngineResult, EngineStatus, HandshakeStatus, TlsEngine};

/// TLS 记录头加最大密文载荷的保守上界，对齐传统引擎的 packet buffer 口径。
const MAX_WIRE_RECORD: usize = 16_709;

/// 基于 `rustls::Connection` 的同步引擎实现。
///
/// # 逻辑解析（How）
/// - `unwrap`：`read_tls` 吞入密文区间，`process_new_packets` 驱动记录层
///   与握手状态机，再从 `reader()` 取出明文写入输出区间；
/// - `wrap`：明文写入 `writer()`（握手期不接受应用数据），随后
///   `write_tls` 把待发送的记录冲入输出区间；
/// - 握手完成沿“本次调用前还在握手、调用后不再握手”的边沿上报一次
///   `Finished`，此后查询与结果都返回 `NotHandshaking`；
/// - rustls 的计算全部内联完成，不排队委托任务，`NeedTask` 永不出现。
///
/// # 契约说明（What）
/// - 连接对象被事件循环线程与后台线程共享，内部以互斥锁串行化访问；
/// - `process_new_packets` 的错误视为安全相关失败，映射为
///   [`EngineError::Crypto`]，由外层记录并终止当轮。
pub struct RustlsEngine {
    conn: Mutex<Connection>,
}

impl RustlsEngine {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn client(conn: ClientConnection) -> Self {
        Self::new(Connection::Client(conn))
    }

    pub fn server(conn: ServerConnection) -> Self {
        Self::new(Connection::Server(conn))
    }

    fn status_of(conn: &Connection, was_handshaking: bool) -> HandshakeStatus {
        if conn.is_handshaking() {
            if conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if was_handshaking {
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn unwrap(&self, input: &[u8], output: &mut [u8]) -> Result<EngineResult, EngineError> {
        let mut guard = self.conn.lock();
        let conn = &mut *guard;
        let was_handshaking = conn.is_handshaking();

        let mut consumed = 0usize;
        if !input.is_empty() {
            let mut cursor = input;
            consumed = conn.read_tls(&mut cursor).map_err(EngineError::Io)?;
        }

        let io_state = conn
            .process_new_packets()
            .map_err(|err| EngineError::Crypto {
                reason: err.to_string(),
            })?;

        let pending = io_state.plaintext_bytes_to_read();
        let mut produced = 0usize;
        if pending > 0 && !output.is_empty() {
            let want = pending.min(output.len());
            match conn.reader().read(&mut output[..want]) {
                Ok(n) => produced = n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(EngineError::Io(err)),
            }
        }

        let status = if io_state.peer_has_closed() && pending == produced {
            EngineStatus::Closed
        } else if pending > produced && produced == output.len() {
            // 明文尚有剩余但输出区间已被填满，留在 rustls 内部等待下次取出。
            EngineStatus::BufferOverflow
        } else if consumed == 0 && produced == 0 && conn.wants_read() {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        let handshake = Self::status_of(conn, was_handshaking);
        Ok(EngineResult {
            status,
            handshake,
            consumed,
            produced,
        })
    }

    fn wrap(&self, input: &[u8], output: &mut [u8]) -> Result<EngineResult, EngineError> {
        let mut guard = self.conn.lock();
        let conn = &mut *guard;
        let was_handshaking = conn.is_handshaking();

        let mut consumed = 0usize;
        if !input.is_empty() && !was_handshaking {
            consumed = conn.writer().write(input).map_err(EngineError::Io)?;
        }

        let capacity = output.len();
        let mut sink: &mut [u8] = output;
        while conn.wants_write() && !sink.is_empty() {
            match conn.write_tls(&mut sink) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => return Err(EngineError::Io(err)),
            }
        }
        let produced = capacity - sink.len();

        let status = if produced == 0 && conn.wants_write() {
            EngineStatus::BufferOverflow
        } else if consumed == 0 && produced == 0 && input.is_empty() && !conn.is_handshaking() {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        let handshake = Self::status_of(conn, was_handshaking);
        Ok(EngineResult {
            status,
            handshake,
            consumed,
            produced,
        })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        let guard = self.conn.lock();
        Self::status_of(&guard, false)
    }

    /// rustls 的握手计算全部内联完成，没有委托任务。
    fn next_delegated_task(&self) -> Option<DelegatedTask> {
        None
    }

    fn record_size_hint(&self) -> usize {
        MAX_WIRE_RECORD
    }
}
