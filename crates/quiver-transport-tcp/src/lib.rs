#![doc = r#"
# quiver-transport-tcp

## 设计动机（Why）
- **定位**：`quiver-core` 契约在纯 TCP 上的实现——客户端建连流水线、
  服务端监听流水线、占位握手协商与绑定到运行时的回调调度器；
- **架构角色**：这一层只负责连接生命周期、活性握手与按整数 id 标识的
  可靠投递管道；查询表达、值的线格式与认证全部留给外部协作者。

## 核心能力（What）
- [`Connector::connect`]：一次订阅一次连接尝试的惰性结果流，套接字、
  字节流与会话在所有退出路径上按同一顺序确定性释放；
- [`Listener::listen`]：无界的终止记录流，逐客户端故障被隔离进各自的
  [`TerminationRecord`]，监听器持续可用；
- 协商器：4 字节令牌回显握手，成功后产出 [`Session`]；
- [`TokioScheduler`]：把双工回调投递单元转投到 Tokio 运行时。

## 实现策略（How）
- 所有挂起点（建连、接受、握手收发、会话收发）统一经内部的上下文
  驱动器执行，取消、截止与 IO 完成三路信号只取首个；
- 被接受连接的流水线以独立任务运行，终止记录经通道汇回监听流；
- 会话释放以 Drop 守卫兜底，优雅路径额外做写半部关闭。

## 风险与考量（Trade-offs）
- 协作式取消依赖毫秒级轮询，取消响应存在相应延迟；
- 握手是占位的活性探测，不交换版本与能力，强化方案见仓库设计文档。
"#]

mod error;
mod io;

pub mod connect;
pub mod listen;
pub mod negotiate;
pub mod scheduler;
pub mod session;

pub use connect::{ClientExecutor, Connector, PrepareSocket, RequestBuilder};
pub use error::{
    FRAME_VIOLATION_CODE, HANDLER_PANICKED_CODE, HANDSHAKE_VIOLATION_CODE, NegotiationFailure,
};
pub use listen::{
    AcceptFailurePolicy, HandlerFactory, ListenOptions, Listener, SessionHandler,
    TerminationRecord,
};
pub use negotiate::HANDSHAKE_TOKEN;
pub use scheduler::TokioScheduler;
pub use session::{DEFAULT_MAX_FRAME, Session, SessionStream};
