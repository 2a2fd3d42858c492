use crate::error::{CONNECT, PREPARE, map_io_error};
use crate::io::drive;
use crate::negotiate::negotiate_client;
use crate::session::{DEFAULT_MAX_FRAME, Session, SessionGuard, SessionStream};
use async_stream::try_stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use quiver_core::codec::{CodecFactory, Message};
use quiver_core::contract::CallContext;
use quiver_core::counter::ConnectionCounters;
use quiver_core::error::QuiverError;
use quiver_core::identity::ConnectionIdentity;
use quiver_core::session::SessionRegistry;
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpSocket;

/// 套接字准备钩子：每个套接字在建连/接受前被调用恰好一次。
///
/// 外部可借此分层 TLS 前的套接字选项、keepalive 等；本层不解释
/// 任何选项语义。
pub trait PrepareSocket: Send + Sync + 'static {
    /// 配置一个尚未连接/刚接受的套接字。
    fn prepare(&self, socket: &SockRef<'_>) -> io::Result<()>;
}

impl<F> PrepareSocket for F
where
    F: Fn(&SockRef<'_>) -> io::Result<()> + Send + Sync + 'static,
{
    fn prepare(&self, socket: &SockRef<'_>) -> io::Result<()> {
        self(socket)
    }
}

/// 请求构造器：对本层不透明，仅消费一次以产出送去执行的消息。
pub trait RequestBuilder: Send + Sync + 'static {
    /// 针对已协商的会话构造请求消息。
    fn build(&self, session: &Arc<Session>) -> Result<Message, QuiverError>;
}

impl<F> RequestBuilder for F
where
    F: Fn(&Arc<Session>) -> Result<Message, QuiverError> + Send + Sync + 'static,
{
    fn build(&self, session: &Arc<Session>) -> Result<Message, QuiverError> {
        self(session)
    }
}

/// 客户端执行层契约：在会话上运行请求并产出结果序列。
///
/// 执行层的故障原样穿过连接流水线（不重试、不本地恢复），
/// 这里只约定形状，不约定求值语义。
#[async_trait::async_trait]
pub trait ClientExecutor: Send + Sync + 'static {
    /// 发送请求并返回解码后的结果流。
    async fn run(
        &self,
        ctx: &CallContext,
        session: Arc<Session>,
        request: Message,
    ) -> Result<BoxStream<'static, Result<Message, QuiverError>>, QuiverError>;
}

/// 客户端连接提供者。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把“建连 → 准备钩子 → 握手协商 → 执行 → 确定性释放”整条客户端
///   流水线收拢为一个惰性序列：一次订阅（首次 poll）对应一次连接
///   尝试，未被 poll 之前不发生任何 IO；
/// - 计数注册表与会话注册表显式注入，不依赖隐藏的全局单例。
///
/// ## 逻辑（How）
/// - `TcpSocket` 先创建后连接，准备钩子在 connect 之前拿到
///   `SockRef` 运行一次；
/// - Tokio 的 connect future 把“内联完成”与“稍后回调完成”折叠为同一个
///   可等待对象，[`drive`] 再叠加取消与截止，三路信号只取首个；
/// - 会话以 Drop 守卫兜底：结果流无论正常耗尽、出错还是中途被丢弃，
///   都先释放会话、再随半部关闭套接字。
///
/// ## 契约（What）
/// - 连接级套接字错误以单个终止错误浮出，原生错误码保留在根因中，
///   本层不重试，也不会构造会话；
/// - 丢弃返回的流等价于取消：在途的建连/协商/读取随 future 一起
///   终止，资源按同样的顺序释放。
pub struct Connector {
    endpoint: SocketAddr,
    codec_factory: Arc<dyn CodecFactory>,
    counters: Arc<ConnectionCounters>,
    registry: Arc<SessionRegistry>,
    prepare: Option<Arc<dyn PrepareSocket>>,
    max_frame: usize,
}

impl Connector {
    /// 面向固定端点创建连接提供者。
    pub fn new(
        endpoint: SocketAddr,
        codec_factory: Arc<dyn CodecFactory>,
        counters: Arc<ConnectionCounters>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            endpoint,
            codec_factory,
            counters,
            registry,
            prepare: None,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// 安装套接字准备钩子。
    pub fn with_prepare_socket(mut self, prepare: Arc<dyn PrepareSocket>) -> Self {
        self.prepare = Some(prepare);
        self
    }

    /// 覆盖单帧长度上限。
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// 发起一次惰性连接尝试，返回结果消息的流。
    pub fn connect(
        &self,
        ctx: CallContext,
        builder: Arc<dyn RequestBuilder>,
        executor: Arc<dyn ClientExecutor>,
    ) -> BoxStream<'static, Result<Message, QuiverError>> {
        let endpoint = self.endpoint;
        let codec_factory = Arc::clone(&self.codec_factory);
        let counters = Arc::clone(&self.counters);
        let registry = Arc::clone(&self.registry);
        let prepare = self.prepare.clone();
        let max_frame = self.max_frame;

        let stream = try_stream! {
            let number = counters.next_client();
            let identity = ConnectionIdentity::client(number, endpoint);
            tracing::debug!(identity = %identity, "发起连接尝试");

            let stream = establish(&ctx, endpoint, prepare.as_deref()).await?;
            let session = negotiate_client(
                &ctx,
                Box::new(stream) as Box<dyn SessionStream>,
                codec_factory.create(),
                ctx.cancellation().child(),
                identity,
                max_frame,
            )
            .await?;
            let guard = SessionGuard::new(Arc::clone(&session));
            Session::register(&session, &registry);

            let request = builder.build(&session)?;
            let mut results = executor.run(&ctx, Arc::clone(&session), request).await?;
            while let Some(item) = results.next().await {
                yield item?;
            }

            // 正常耗尽：优雅关闭写半部后再释放，守卫随即成为空操作。
            session.mark_completed();
            session.dispose().await;
            drop(guard);
        };
        stream.boxed()
    }
}

async fn establish(
    ctx: &CallContext,
    endpoint: SocketAddr,
    prepare: Option<&dyn PrepareSocket>,
) -> Result<tokio::net::TcpStream, QuiverError> {
    let socket = match endpoint {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|error| map_io_error(CONNECT, error))?;

    if let Some(hook) = prepare {
        let socket_ref = SockRef::from(&socket);
        hook.prepare(&socket_ref)
            .map_err(|error| map_io_error(PREPARE, error))?;
    }

    drive(ctx, CONNECT, socket.connect(endpoint)).await
}
