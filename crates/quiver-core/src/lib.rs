#![doc = r#"
# quiver-core

## 设计动机（Why）
- **定位**：该 crate 收纳远程查询传输层的全部契约类型——调用上下文、
  稳定错误域、连接计数、会话控制与双工回调通道——供具体传输实现复用。
- **架构角色**：本 crate 不触碰任何套接字；真正的 TCP 建连/监听流水线
  位于 `quiver-transport-tcp`，它只依赖这里定义的契约。
- **设计理念**：所有跨调度边界的失败都以显式的故障值
  （[`Fault`](crate::error::Fault)）传递，绝不让一个连接生命周期内的
  异常逃逸到兄弟连接或框架的派发机制中。

## 核心契约（What）
- **上下文**：[`CallContext`](crate::contract::CallContext) 捆绑取消与
  截止信号，传输层的每个挂起点都必须感知它；
- **错误域**：[`QuiverError`](crate::error::QuiverError) 以稳定错误码 +
  分类驱动上层处置，`cause` 链保留原始根因；
- **会话**：[`SessionControl`](crate::session::SessionControl) 暴露
  “取消全部通信”的逃生门，[`SessionRegistry`](crate::session::SessionRegistry)
  以弱引用解析会话，保证回调不会延长已拆除会话的生命周期；
- **双工回调**：[`DuplexCallbackObservable`](crate::callback::DuplexCallbackObservable)
  把按整数 id 派发的远端值流转成本地可观察序列，通知经调度器串行投递。

## 实现策略（How）
- 契约层保持对象安全与 `Send + Sync`，便于实现层以 `Arc` 共享；
- 计数器与取消位均以原子操作实现，注册表以互斥表 + 弱引用组合；
- 回调通道内部用“逐 id 串行队列”把任意调度器变成顺序执行器。

## 风险与考量（Trade-offs）
- 本 crate 假定 std 环境；相比完整框架省去 `no_std` 分支以换取
  实现层直接复用 `std::net`/Tokio 类型的便利；
- 调度器契约只有一个 `schedule` 入口，不提供优先级与延迟语义，
  上层如需更复杂的调度策略应自带实现。
"#]

pub mod callback;
pub mod codec;
pub mod contract;
pub mod counter;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod session;
pub mod test_stubs;

pub use callback::{DetachHandle, DuplexCallback, DuplexCallbackObservable, Observer, Scheduler};
pub use codec::{CodecFactory, Message, MessageCodec};
pub use contract::{CallContext, Cancellation, Deadline, MonotonicTimePoint};
pub use counter::{ConnectionCounters, Counter};
pub use dispatch::{CallbackId, CallbackNotification, DispatchSink};
pub use error::{ErrorCategory, Fault, FaultStage, QuiverError};
pub use identity::{ConnectionIdentity, ConnectionScope};
pub use session::{SessionControl, SessionId, SessionRegistry, ShutdownReason};

/// 框架统一的返回值别名，默认错误类型为 [`QuiverError`]。
pub type Result<T, E = QuiverError> = core::result::Result<T, E>;
