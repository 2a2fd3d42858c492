use quiver_core::error::{ErrorCategory, QuiverError};
use std::io;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "quiver.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "quiver.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "quiver.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const PREPARE: OperationKind = OperationKind {
    code: "quiver.transport.tcp.prepare_failed",
    message: "socket prepare hook",
};
pub(crate) const HANDSHAKE_SEND: OperationKind = OperationKind {
    code: "quiver.transport.tcp.handshake_send_failed",
    message: "handshake send",
};
pub(crate) const HANDSHAKE_RECV: OperationKind = OperationKind {
    code: "quiver.transport.tcp.handshake_recv_failed",
    message: "handshake recv",
};
pub(crate) const SEND: OperationKind = OperationKind {
    code: "quiver.transport.tcp.send_failed",
    message: "session send",
};
pub(crate) const RECV: OperationKind = OperationKind {
    code: "quiver.transport.tcp.recv_failed",
    message: "session recv",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "quiver.transport.tcp.shutdown_failed",
    message: "session shutdown",
};

const CANCEL_CODE: &str = "quiver.transport.tcp.cancelled";
const TIMEOUT_CODE: &str = "quiver.transport.tcp.timeout";

/// 握手回显不匹配的稳定错误码。
pub const HANDSHAKE_VIOLATION_CODE: &str = "quiver.transport.tcp.handshake_violation";
/// 帧长度超出会话上限的稳定错误码。
pub const FRAME_VIOLATION_CODE: &str = "quiver.transport.tcp.frame_violation";
/// 服务端处理器 panic 的稳定错误码。
pub const HANDLER_PANICKED_CODE: &str = "quiver.transport.tcp.handler_panicked";

/// 协商失败的结构化根因。
#[derive(Debug, thiserror::Error)]
pub enum NegotiationFailure {
    /// 活性探测回显与发送值不一致。
    #[error("handshake token mismatch: sent {sent:?}, received {received:?}")]
    TokenMismatch { sent: [u8; 4], received: [u8; 4] },
}

/// 将 IO 错误映射为框架错误，原始 `io::Error` 作为根因保留，
/// 使原生错误码（`raw_os_error`）可被调用方取回。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> QuiverError {
    let category = match error.kind() {
        io::ErrorKind::TimedOut => ErrorCategory::Timeout,
        _ => ErrorCategory::Io,
    };
    let rendered = format!("{}: {}", kind.message, error);
    QuiverError::new(kind.code, rendered)
        .with_cause(error)
        .with_category(category)
}

/// 构造取消错误。
pub(crate) fn cancelled_error(kind: OperationKind) -> QuiverError {
    QuiverError::new(CANCEL_CODE, format!("{} cancelled", kind.message))
        .with_category(ErrorCategory::Cancelled)
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> QuiverError {
    QuiverError::new(TIMEOUT_CODE, format!("{} timed out", kind.message))
        .with_category(ErrorCategory::Timeout)
}

/// 构造握手违例错误。
pub(crate) fn handshake_violation(sent: [u8; 4], received: [u8; 4]) -> QuiverError {
    QuiverError::new(HANDSHAKE_VIOLATION_CODE, "handshake echo mismatch")
        .with_cause(NegotiationFailure::TokenMismatch { sent, received })
        .with_category(ErrorCategory::ProtocolViolation)
}

/// 把外部代码（处理器、工厂或钩子）panic 的载荷收敛为故障，
/// panic 文案尽力保留。
pub(crate) fn handler_panicked(payload: Box<dyn std::any::Any + Send>) -> QuiverError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    QuiverError::new(HANDLER_PANICKED_CODE, format!("panicked: {detail}"))
        .with_category(ErrorCategory::Execution)
}

/// 构造帧长度违例错误。
pub(crate) fn frame_violation(length: usize, limit: usize) -> QuiverError {
    QuiverError::new(
        FRAME_VIOLATION_CODE,
        format!("frame length {length} exceeds limit {limit}"),
    )
    .with_category(ErrorCategory::ProtocolViolation)
}
