use crate::connect::PrepareSocket;
use crate::error::{ACCEPT, BIND, PREPARE, handler_panicked, map_io_error};
use crate::io::drive;
use crate::negotiate::negotiate_server;
use crate::session::{DEFAULT_MAX_FRAME, Session, SessionGuard, SessionStream};
use async_stream::try_stream;
use futures::FutureExt;
use futures::StreamExt;
use futures::stream::BoxStream;
use quiver_core::codec::CodecFactory;
use quiver_core::contract::{CallContext, Cancellation};
use quiver_core::counter::{ConnectionCounters, Counter};
use quiver_core::error::{Fault, QuiverError};
use quiver_core::identity::ConnectionIdentity;
use quiver_core::session::{SessionRegistry, ShutdownReason};
use socket2::SockRef;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::mpsc;

/// 接受操作本身出错时的策略。
///
/// 来源行为是让整个监听流以该错误终止；是否改为捕获并重试被留作
/// 配置决定，两种语义都在此显式表达。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptFailurePolicy {
    /// 接受级错误作为监听流的单个终止错误浮出（缺省）。
    Fatal,
    /// 记录日志并在退避后继续接受。
    Retry { delay: Duration },
}

impl Default for AcceptFailurePolicy {
    fn default() -> Self {
        Self::Fatal
    }
}

/// 监听配置：端点、接受失败策略、套接字准备钩子与帧上限。
/// 其余服务配置对本层不透明，由宿主自行解释。
pub struct ListenOptions {
    endpoint: SocketAddr,
    accept_failure: AcceptFailurePolicy,
    prepare: Option<Arc<dyn PrepareSocket>>,
    max_frame: usize,
}

impl ListenOptions {
    /// 以监听端点创建缺省配置。
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            accept_failure: AcceptFailurePolicy::default(),
            prepare: None,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// 覆盖接受失败策略。
    pub fn with_accept_failure(mut self, policy: AcceptFailurePolicy) -> Self {
        self.accept_failure = policy;
        self
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
}

/// 服务端执行层契约：针对一个已协商会话运行请求应答循环。
#[async_trait::async_trait]
pub trait SessionHandler: Send + 'static {
    /// 驱动该会话直到自然完成、取消或出错。
    async fn run(&mut self, ctx: &CallContext, session: Arc<Session>) -> Result<(), QuiverError>;
}

/// 处理器工厂：每个协商成功的会话创建一个处理器。
pub trait HandlerFactory: Send + Sync + 'static {
    /// 为会话创建处理器。
    fn create(&self, session: &Arc<Session>) -> Result<Box<dyn SessionHandler>, QuiverError>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&Arc<Session>) -> Result<Box<dyn SessionHandler>, QuiverError> + Send + Sync + 'static,
{
    fn create(&self, session: &Arc<Session>) -> Result<Box<dyn SessionHandler>, QuiverError> {
        self(session)
    }
}

/// 每个完结的服务端客户端连接发出一条终止记录。
#[derive(Debug)]
pub struct TerminationRecord {
    identity: ConnectionIdentity,
    local: SocketAddr,
    remote: SocketAddr,
    elapsed: Duration,
    shutdown: ShutdownReason,
    faults: Vec<Fault>,
}

impl TerminationRecord {
    /// 连接身份。
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// 本端端点。
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// 对端端点。
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// 从接受到收尾的耗时。
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// 终止分类。
    pub fn shutdown(&self) -> ShutdownReason {
        self.shutdown
    }

    /// 捕获的故障，按发生顺序。
    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }
}

/// 服务端监听提供者。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把“绑定 → 循环接受 → 逐客户端协商/执行/收尾 → 终止记录”收拢为
///   一个无界惰性序列：一次激活对应一个监听器生命周期；
/// - 单个客户端的故障被隔离进它自己的终止记录，绝不波及兄弟连接，
///   也绝不以错误形态浮出监听流本身。
///
/// ## 逻辑（How）
/// - 接受循环是显式 loop + 取消检查；每个被接受的连接分配监听器
///   作用域内的顺序编号，随后整条流水线作为独立任务 spawn 出去；
/// - 流水线任务通过无界通道把终止记录送回监听流；循环以 biased
///   select 在“回收记录”与“接受新连接”之间复用；
/// - 处理器的 panic 经 `catch_unwind` 收敛为执行故障，显式取消被
///   静默视作正常终止；
/// - 丢弃监听流或取消其上下文只停止接受；已 spawn 的客户端流水线
///   运行至各自的自然终点（其记录不再被观察）。
///
/// ## 契约（What）
/// - 逐客户端故障只出现在对应记录的故障列表里；唯一的例外是接受
///   操作自身的错误，按 [`AcceptFailurePolicy`] 终止监听流或退避重试。
pub struct Listener {
    options: ListenOptions,
    codec_factory: Arc<dyn CodecFactory>,
    counters: Arc<ConnectionCounters>,
    registry: Arc<SessionRegistry>,
}

enum LoopStep {
    Record(Option<TerminationRecord>),
    Accepted(Result<(TcpStream, SocketAddr), QuiverError>),
}

impl Listener {
    /// 创建监听提供者。
    pub fn new(
        options: ListenOptions,
        codec_factory: Arc<dyn CodecFactory>,
        counters: Arc<ConnectionCounters>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            options,
            codec_factory,
            counters,
            registry,
        }
    }

    /// 激活监听器，返回终止记录的无界流。
    pub fn listen(
        self,
        ctx: CallContext,
        factory: Arc<dyn HandlerFactory>,
    ) -> BoxStream<'static, Result<TerminationRecord, QuiverError>> {
        let Listener {
            options,
            codec_factory,
            counters,
            registry,
        } = self;

        let stream = try_stream! {
            let server_number = counters.next_server();
            let listener = TokioTcpListener::bind(options.endpoint)
                .await
                .map_err(|error| map_io_error(BIND, error))?;
            let local = listener
                .local_addr()
                .map_err(|error| map_io_error(BIND, error))?;
            let server_identity = ConnectionIdentity::server(server_number, local);
            tracing::info!(identity = %server_identity, "监听已启动");

            let client_numbers = Counter::new();
            let (records_tx, mut records_rx) = mpsc::unbounded_channel::<TerminationRecord>();

            loop {
                let step = tokio::select! {
                    biased;
                    maybe = records_rx.recv() => LoopStep::Record(maybe),
                    outcome = drive(&ctx, ACCEPT, listener.accept()) => LoopStep::Accepted(outcome),
                };
                match step {
                    LoopStep::Record(Some(record)) => yield record,
                    // 本地持有发送端，通道不会在循环存活期间关闭。
                    LoopStep::Record(None) => break,
                    LoopStep::Accepted(Ok((stream, remote))) => {
                        let identity = ConnectionIdentity::accepted_client(
                            server_number,
                            client_numbers.next(),
                            remote,
                        );
                        let pipeline = ClientPipeline {
                            identity,
                            local,
                            remote,
                            codec_factory: Arc::clone(&codec_factory),
                            registry: Arc::clone(&registry),
                            prepare: options.prepare.clone(),
                            max_frame: options.max_frame,
                            factory: Arc::clone(&factory),
                        };
                        let records_tx = records_tx.clone();
                        // 独立任务：一个客户端的慢与坏不影响继续接受。
                        tokio::spawn(async move {
                            let record = pipeline.run(stream).await;
                            let _ = records_tx.send(record);
                        });
                    }
                    LoopStep::Accepted(Err(error)) if error.is_cancelled() => {
                        tracing::info!(identity = %server_identity, "监听取消，停止接受");
                        break;
                    }
                    LoopStep::Accepted(Err(error)) => match options.accept_failure {
                        AcceptFailurePolicy::Fatal => {
                            Err::<(), _>(error)?;
                        }
                        AcceptFailurePolicy::Retry { delay } => {
                            tracing::warn!(
                                identity = %server_identity,
                                "接受连接失败，{delay:?} 后重试：{error}"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    },
                }
            }
        };
        stream.boxed()
    }
}

struct ClientPipeline {
    identity: ConnectionIdentity,
    local: SocketAddr,
    remote: SocketAddr,
    codec_factory: Arc<dyn CodecFactory>,
    registry: Arc<SessionRegistry>,
    prepare: Option<Arc<dyn PrepareSocket>>,
    max_frame: usize,
    factory: Arc<dyn HandlerFactory>,
}

impl ClientPipeline {
    /// 跑完一个被接受连接的完整流水线并汇总成终止记录。
    ///
    /// 本函数不向外抛任何错误：协商与执行的故障全部被捕获进记录，
    /// 会话恰好释放一次。
    async fn run(self, stream: TcpStream) -> TerminationRecord {
        let started = Instant::now();
        let mut faults = Vec::new();

        // 客户端流水线拥有独立取消范围：监听器的取消不会强行中止它。
        let ctx = CallContext::builder()
            .with_cancellation(Cancellation::new())
            .build();

        // 准备钩子是外部代码：panic 同样收敛为故障而不是吞掉记录。
        let prepared = std::panic::catch_unwind(AssertUnwindSafe(|| self.apply_prepare(&stream)));
        match prepared {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                faults.push(Fault::connect(error));
                return self.finish(started, ShutdownReason::NegotiationError, faults);
            }
            Err(payload) => {
                faults.push(Fault::connect(handler_panicked(payload)));
                return self.finish(started, ShutdownReason::NegotiationError, faults);
            }
        }

        let session = match negotiate_server(
            &ctx,
            Box::new(stream) as Box<dyn SessionStream>,
            self.codec_factory.create(),
            ctx.cancellation().child(),
            self.identity.clone(),
            self.max_frame,
        )
        .await
        {
            Ok(session) => session,
            Err(error) if error.is_cancelled() => {
                return self.finish(started, ShutdownReason::NegotiationCancelled, faults);
            }
            Err(error) => {
                faults.push(Fault::negotiation(error));
                return self.finish(started, ShutdownReason::NegotiationError, faults);
            }
        };

        let guard = SessionGuard::new(Arc::clone(&session));
        Session::register(&session, &self.registry);

        // 处理器工厂与处理器同属外部代码，panic 捕获覆盖二者：
        // 无论哪一侧失控，本客户端仍恰好产出一条终止记录。
        let run = AssertUnwindSafe(async {
            let mut handler = self.factory.create(&session)?;
            handler.run(&ctx, Arc::clone(&session)).await
        })
        .catch_unwind()
        .await;
        match run {
            Ok(Ok(())) => session.mark_completed(),
            // 显式取消静默处理：该客户端按正常终止收尾。
            Ok(Err(error)) if error.is_cancelled() => session.mark_execution_cancelled(),
            Ok(Err(error)) => session.record_fault(Fault::execution(error)),
            Err(payload) => session.record_fault(Fault::execution(handler_panicked(payload))),
        }

        // 先释放再汇总，优雅关闭阶段新增的清理故障也进记录。
        session.dispose().await;
        faults.extend(session.take_faults());
        let shutdown = session.shutdown_reason();
        drop(guard);

        self.finish(started, shutdown, faults)
    }

    fn apply_prepare(&self, stream: &TcpStream) -> Result<(), QuiverError> {
        if let Some(hook) = &self.prepare {
            let socket_ref = SockRef::from(stream);
            hook.prepare(&socket_ref)
                .map_err(|error| map_io_error(PREPARE, error))?;
        }
        Ok(())
    }

    fn finish(
        &self,
        started: Instant,
        shutdown: ShutdownReason,
        faults: Vec<Fault>,
    ) -> TerminationRecord {
        let record = TerminationRecord {
            identity: self.identity.clone(),
            local: self.local,
            remote: self.remote,
            elapsed: started.elapsed(),
            shutdown,
            faults,
        };
        tracing::debug!(
            identity = %record.identity,
            shutdown = %record.shutdown,
            faults = record.faults.len(),
            "客户端流水线完结"
        );
        record
    }
}
