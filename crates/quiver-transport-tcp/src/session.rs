use crate::error::{RECV, SEND, SHUTDOWN, frame_violation};
use crate::io::drive;
use bytes::Bytes;
use quiver_core::codec::{Message, MessageCodec};
use quiver_core::contract::{CallContext, Cancellation};
use quiver_core::dispatch::DispatchSink;
use quiver_core::error::{ErrorCategory, Fault, QuiverError, codes};
use quiver_core::identity::ConnectionIdentity;
use quiver_core::session::{SessionControl, SessionId, SessionRegistry, ShutdownReason};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

/// 会话承载的字节流抽象：真实 TCP 流与测试用内存双工流都满足。
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// 缺省的单帧长度上限。
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

struct SessionState {
    faults: Vec<Fault>,
    shutdown: ShutdownReason,
    registration: Option<(Arc<SessionRegistry>, SessionId)>,
}

/// 协商成功后绑定到一条物理连接的会话对象。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 会话在其生命周期内拥有底层字节流，对上暴露编码消息的收发、
///   取消范围与“取消全部通信”的逃生门；
/// - 每条物理连接同一时刻只存在一个会话：握手成功后创建，所属
///   流水线收尾时销毁，销毁至多发生一次。
///
/// ## 逻辑（How）
/// - 字节流拆成读/写两个半部，各自以异步互斥锁保护，收发可以全双工
///   并发而互不阻塞；
/// - 线格式为 `u32` 大端长度前缀 + 编码负载；超出上限按协议违例处理；
/// - 故障与终止分类记录在内部状态里，供监听流水线汇总进终止记录；
/// - `release` 是同步的幂等收尾（拆除派发汇、注销、丢弃半部），
///   `dispose` 在其之前尽力做一次优雅的写半部关闭。
///
/// ## 契约（What）
/// - `send`/`recv` 在会话被拆除后立即失败；`recv` 在对端干净关闭时
///   返回 `Ok(None)`；
/// - `cancel_all_communication` 首次调用记录故障、标记 `SessionFatal`
///   并取消范围；后续调用为空操作并返回 `false`；
/// - 所有在途收发都持有半部锁，因此 `dispose` 等待锁即等待它们落定。
pub struct Session {
    identity: ConnectionIdentity,
    codec: Arc<dyn MessageCodec>,
    cancellation: Cancellation,
    reader: AsyncMutex<Option<ReadHalf<Box<dyn SessionStream>>>>,
    writer: AsyncMutex<Option<WriteHalf<Box<dyn SessionStream>>>>,
    sink: Arc<DispatchSink>,
    state: Mutex<SessionState>,
    torn_down: AtomicBool,
    released: AtomicBool,
    max_frame: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("torn_down", &self.torn_down)
            .field("released", &self.released)
            .field("max_frame", &self.max_frame)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// 以已完成握手的字节流构造会话。
    pub(crate) fn new(
        stream: Box<dyn SessionStream>,
        codec: Arc<dyn MessageCodec>,
        cancellation: Cancellation,
        identity: ConnectionIdentity,
        max_frame: usize,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new(Self {
            identity,
            codec,
            cancellation,
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            sink: DispatchSink::new(),
            state: Mutex::new(SessionState {
                faults: Vec::new(),
                shutdown: ShutdownReason::None,
                registration: None,
            }),
            torn_down: AtomicBool::new(false),
            released: AtomicBool::new(false),
            max_frame,
        })
    }

    /// 连接身份。
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// 会话的取消范围。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 会话的派发汇，双工回调经此附着。
    pub fn dispatch_sink(&self) -> &Arc<DispatchSink> {
        &self.sink
    }

    /// 注册到会话注册表，返回会话标识；注销在 `release` 中自动发生。
    pub fn register(session: &Arc<Self>, registry: &Arc<SessionRegistry>) -> SessionId {
        let control = Arc::downgrade(session) as Weak<dyn SessionControl>;
        let id = registry.register(control, Arc::downgrade(&session.sink));
        let mut state = session.lock_state();
        state.registration = Some((Arc::clone(registry), id));
        id
    }

    /// 发送一条消息。
    pub async fn send(&self, ctx: &CallContext, message: &Message) -> Result<(), QuiverError> {
        self.ensure_usable()?;
        let payload = self.codec.encode(message)?;
        if payload.len() > self.max_frame {
            return Err(frame_violation(payload.len(), self.max_frame));
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(session_released_error)?;
        let header = (payload.len() as u32).to_be_bytes();
        drive(ctx, SEND, async {
            writer.write_all(&header).await?;
            writer.write_all(&payload).await?;
            writer.flush().await
        })
        .await
    }

    /// 接收一条消息；对端干净关闭时返回 `Ok(None)`。
    pub async fn recv(&self, ctx: &CallContext) -> Result<Option<Message>, QuiverError> {
        self.ensure_usable()?;
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(session_released_error)?;
        let max_frame = self.max_frame;
        let frame = drive(ctx, RECV, read_frame(reader, max_frame)).await?;
        match frame {
            Some(Ok(payload)) => Ok(Some(self.codec.decode(payload)?)),
            Some(Err(violation)) => Err(violation),
            None => Ok(None),
        }
    }

    /// 记录一条会话内部故障。
    pub fn record_fault(&self, fault: Fault) {
        let mut state = self.lock_state();
        state.faults.push(fault);
    }

    /// 取走累计的故障列表。
    pub fn take_faults(&self) -> Vec<Fault> {
        let mut state = self.lock_state();
        std::mem::take(&mut state.faults)
    }

    /// 会话自身的终止分类。
    pub fn shutdown_reason(&self) -> ShutdownReason {
        self.lock_state().shutdown
    }

    /// 执行自然完成；不覆盖已有的终止分类。
    pub fn mark_completed(&self) {
        self.mark_if_unset(ShutdownReason::Completed);
    }

    /// 执行被显式取消；按正常终止对待，不覆盖已有分类。
    pub fn mark_execution_cancelled(&self) {
        self.mark_if_unset(ShutdownReason::ExecutionCancelled);
    }

    fn mark_if_unset(&self, reason: ShutdownReason) {
        let mut state = self.lock_state();
        if state.shutdown == ShutdownReason::None {
            state.shutdown = reason;
        }
    }

    /// 优雅销毁：冲刷并关闭写半部，然后执行幂等收尾。
    ///
    /// 在所有退出路径上（正常、出错、取消）都必须恰好生效一次；
    /// 异步路径调用本方法，Drop 兜底只执行同步的 [`Session::release`]。
    pub async fn dispose(&self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            let ctx = CallContext::builder().build();
            if let Err(shutdown_error) = drive(&ctx, SHUTDOWN, writer.shutdown()).await {
                self.record_fault(Fault::cleanup(shutdown_error));
            }
        }
        drop(guard);
        self.release();
    }

    /// 同步收尾：拆除派发汇、注销注册表、丢弃两个半部。幂等。
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sink.tear_down();
        let registration = {
            let mut state = self.lock_state();
            state.registration.take()
        };
        if let Some((registry, id)) = registration {
            registry.deregister(id);
        }
        // 半部随锁内的 Option 丢弃，底层套接字随之关闭；
        // 若仍有在途 IO 持锁，try_lock 失败，半部将在其落定后由
        // 下一次 dispose/Drop 丢弃。
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        tracing::debug!(identity = %self.identity, "会话已释放");
    }

    fn ensure_usable(&self) -> Result<(), QuiverError> {
        if self.torn_down.load(Ordering::Acquire) || self.released.load(Ordering::Acquire) {
            return Err(session_released_error());
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SessionControl for Session {
    /// 以捕获的故障切断全部后续通信；首次调用返回 `true`。
    fn cancel_all_communication(&self, fault: Fault) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::warn!(identity = %self.identity, "会话级故障，取消全部通信：{fault}");
        {
            let mut state = self.lock_state();
            state.faults.push(fault);
            state.shutdown = ShutdownReason::SessionFatal;
        }
        self.cancellation.cancel();
        self.sink.tear_down();
        true
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

fn session_released_error() -> QuiverError {
    QuiverError::new(codes::SESSION_TORN_DOWN, "session torn down")
        .with_category(ErrorCategory::SessionFatal)
}

/// 读一帧：返回 `None` 表示对端在帧边界干净关闭；
/// `Some(Err(_))` 表示帧长度违例（IO 层成功但协议层失败）。
async fn read_frame(
    reader: &mut ReadHalf<Box<dyn SessionStream>>,
    max_frame: usize,
) -> io::Result<Option<Result<Bytes, QuiverError>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid frame header",
            ));
        }
        filled += n;
    }
    let length = u32::from_be_bytes(header) as usize;
    if length > max_frame {
        return Ok(Some(Err(frame_violation(length, max_frame))));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Ok(Bytes::from(payload))))
}

/// 以 Drop 兜底的会话释放守卫：无论流水线以何种方式退出，
/// 会话先释放、套接字随半部关闭的顺序都成立。
pub(crate) struct SessionGuard {
    session: Arc<Session>,
}

impl SessionGuard {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FRAME_VIOLATION_CODE;
    use quiver_core::test_stubs::IdentityCodec;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_identity() -> ConnectionIdentity {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        ConnectionIdentity::client(1, addr)
    }

    fn session_pair(max_frame: usize) -> (Arc<Session>, Arc<Session>) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let codec: Arc<dyn MessageCodec> = Arc::new(IdentityCodec);
        let a = Session::new(
            Box::new(left),
            Arc::clone(&codec),
            Cancellation::new(),
            test_identity(),
            max_frame,
        );
        let b = Session::new(
            Box::new(right),
            codec,
            Cancellation::new(),
            test_identity(),
            max_frame,
        );
        (a, b)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_recv_round_trip_and_clean_close() -> anyhow::Result<()> {
        let (a, b) = session_pair(DEFAULT_MAX_FRAME);
        let ctx = CallContext::builder().build();
        a.send(&ctx, &Message::from_payload(Bytes::from_static(b"hello")))
            .await?;
        let received = b.recv(&ctx).await?.expect("应收到一条消息");
        assert_eq!(received.payload().as_ref(), b"hello");

        // 对端优雅关闭写半部后，recv 在帧边界返回 None。
        a.dispose().await;
        assert!(b.recv(&ctx).await?.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_frame_is_rejected_before_write() -> anyhow::Result<()> {
        let (a, _b) = session_pair(8);
        let ctx = CallContext::builder().build();
        let error = a
            .send(&ctx, &Message::from_payload(Bytes::from(vec![0u8; 9])))
            .await
            .unwrap_err();
        assert_eq!(error.code(), FRAME_VIOLATION_CODE);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_all_communication_is_first_call_wins() -> anyhow::Result<()> {
        let (a, _b) = session_pair(DEFAULT_MAX_FRAME);
        let boom = || Fault::execution(QuiverError::new("quiver.test.boom", "boom"));
        assert!(a.cancel_all_communication(boom()));
        assert!(!a.cancel_all_communication(boom()));
        assert!(a.is_torn_down());
        assert!(a.cancellation().is_cancelled());
        assert_eq!(a.shutdown_reason(), ShutdownReason::SessionFatal);

        let ctx = CallContext::builder().build();
        let error = a
            .send(&ctx, &Message::from_payload(Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(error.code(), codes::SESSION_TORN_DOWN);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_deregisters_from_registry() -> anyhow::Result<()> {
        let registry = SessionRegistry::new();
        let (a, _b) = session_pair(DEFAULT_MAX_FRAME);
        let id = Session::register(&a, &registry);
        assert!(registry.control(id).is_some());
        a.release();
        assert!(registry.control(id).is_none());
        assert!(a.dispatch_sink().is_torn_down());
        Ok(())
    }
}
