use core::fmt;
use std::borrow::Cow;
use std::error::Error;

/// 封装底层原因的别名，保持 `Send + Sync` 以便跨线程传递。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// `QuiverError` 是传输层跨 crate 共享的稳定错误域。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 建连、握手、会话执行与回调派发在不同层次产生故障，需要合流为
///   统一的错误码，供日志与终止记录做精确分类；
/// - 原生套接字错误必须原样穿透到调用方（调用方要能取回原生错误码），
///   因此根因以 `cause` 链保留而不是格式化成字符串丢弃。
///
/// ## 逻辑（How）
/// - 以 Builder 风格方法叠加根因与分类；`code` 恒为 `'static` 字符串，
///   承载稳定语义；`message` 面向排障人员；
/// - `source()` 暴露完整根因链，调用方可逐层 `downcast`（例如取回
///   `std::io::Error` 的 `raw_os_error`）。
///
/// ## 契约（What）
/// - **前置条件**：错误码遵循 `<域>.<语义>` 约定（见 [`codes`]）；
/// - **后置条件**：返回值 `Send + Sync + 'static`，可安全跨线程移动；
///   未显式设置分类时默认为 [`ErrorCategory::NonRetryable`]。
#[derive(Debug)]
pub struct QuiverError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

impl QuiverError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附带底层原因并返回新错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 标记结构化分类信息。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 获取结构化分类；未显式设置时回退为 `NonRetryable`。
    pub fn category(&self) -> ErrorCategory {
        self.category.unwrap_or(ErrorCategory::NonRetryable)
    }

    /// 判断是否为取消类错误，供“静默吞掉显式取消”的路径使用。
    pub fn is_cancelled(&self) -> bool {
        matches!(self.category(), ErrorCategory::Cancelled)
    }
}

impl fmt::Display for QuiverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for QuiverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

/// 错误分类枚举，对应传输层的故障分类学。
///
/// ## 契约（What）
/// - `Io`：套接字层原生故障（connect/accept/读写）；
/// - `ProtocolViolation`：握手回显不匹配或帧格式违例；
/// - `Cancelled` / `Timeout`：取消与截止语义，二者都会中止会话创建；
/// - `Execution`：运行请求/响应负载时抛出的故障（服务端捕获不传播）；
/// - `SessionFatal`：由双工回调通道升级的会话级致命故障；
/// - `NonRetryable`：兜底分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Io,
    ProtocolViolation,
    Cancelled,
    Timeout,
    Execution,
    SessionFatal,
    NonRetryable,
}

/// 稳定错误码表，按 `<域>.<语义>` 命名。
pub mod codes {
    /// 回调附着目标不存在或会话已拆除。
    pub const DISPATCH_ATTACH_REJECTED: &str = "quiver.dispatch.attach_rejected";
    /// 同一 id 在未解除附着前被重复占用。
    pub const DISPATCH_ID_OCCUPIED: &str = "quiver.dispatch.id_occupied";
    /// 本地观察者处理通知时失败。
    pub const CALLBACK_OBSERVER_FAILED: &str = "quiver.callback.observer_failed";
    /// 会话注册表中找不到目标会话。
    pub const SESSION_NOT_FOUND: &str = "quiver.session.not_found";
    /// 会话已被“取消全部通信”拆除。
    pub const SESSION_TORN_DOWN: &str = "quiver.session.torn_down";
}

/// 故障发生的阶段，用于终止记录与日志定位。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultStage {
    /// 套接字建立阶段。
    Connect,
    /// 会话协商阶段。
    Negotiation,
    /// 请求/响应执行阶段。
    Execution,
    /// 回调通知派发阶段。
    Dispatch,
    /// 资源释放阶段。
    Cleanup,
}

impl fmt::Display for FaultStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultStage::Connect => "connect",
            FaultStage::Negotiation => "negotiation",
            FaultStage::Execution => "execution",
            FaultStage::Dispatch => "dispatch",
            FaultStage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// 显式故障值：跨异步/调度边界传递的“被捕获的异常”。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 回调通知在调度器上执行时已完全脱离任何能观察或重试它的调用方，
///   失败只能以值的形式捕获并升级，而不是沿调用栈抛出；
/// - 终止记录需要还原“在哪个阶段、因何失败”，所以故障除错误本体外
///   还携带阶段标记。
///
/// ## 契约（What）
/// - `stage` 标识故障发生的流水线阶段；
/// - `error` 保留原始错误码、分类与根因链，不做降采样。
#[derive(Debug)]
pub struct Fault {
    stage: FaultStage,
    error: QuiverError,
}

impl Fault {
    /// 以指定阶段包装错误。
    pub fn new(stage: FaultStage, error: QuiverError) -> Self {
        Self { stage, error }
    }

    /// 建连阶段故障。
    pub fn connect(error: QuiverError) -> Self {
        Self::new(FaultStage::Connect, error)
    }

    /// 协商阶段故障。
    pub fn negotiation(error: QuiverError) -> Self {
        Self::new(FaultStage::Negotiation, error)
    }

    /// 执行阶段故障。
    pub fn execution(error: QuiverError) -> Self {
        Self::new(FaultStage::Execution, error)
    }

    /// 派发阶段故障。
    pub fn dispatch(error: QuiverError) -> Self {
        Self::new(FaultStage::Dispatch, error)
    }

    /// 清理阶段故障。
    pub fn cleanup(error: QuiverError) -> Self {
        Self::new(FaultStage::Cleanup, error)
    }

    /// 故障阶段。
    pub fn stage(&self) -> FaultStage {
        self.stage
    }

    /// 故障错误本体。
    pub fn error(&self) -> &QuiverError {
        &self.error
    }

    /// 拆出错误本体。
    pub fn into_error(self) -> QuiverError {
        self.error
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault: {}", self.stage, self.error)
    }
}
