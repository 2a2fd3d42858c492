use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 取消原语，统一表达传输层各流水线的可中断性契约。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 建连、握手、收发与接受循环都是挂起点，必须能被外部主动打断，
///   否则一次悬挂的 IO 会拖住整条流水线的资源释放；
/// - 会话的“取消全部通信”逃生门也复用同一原子位，保证故障升级后
///   任何后续 IO 立即失败。
///
/// ## 逻辑（How）
/// - 内部是 `Arc<AtomicBool>`；`cancel` 通过 CAS 保证只有首次调用返回
///   `true`，便于“恰好一次”的兜底逻辑；
/// - `child` 派生共享同一原子位的令牌，用于把取消信号传进子任务。
///
/// ## 契约（What）
/// - **前置条件**：无；构造后处于“未取消”状态；
/// - **后置条件**：`cancel` 成功后 `is_cancelled` 对所有持有者可见，
///   感知该令牌的挂起点应尽快以取消错误退出。
///
/// ## 注意事项（Trade-offs）
/// - 不提供回调通知，挂起点需要自行轮询或与定时器组合；
/// - 框架不会强制终止正在执行的 Future，取消是协作式的。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 标记取消；返回 `true` 表示本次调用首次触发取消。
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 派生共享同一取消位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

/// 单调时间点，以“距进程基准时刻的偏移”表示，避免依赖壁钟。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MonotonicTimePoint {
    offset: Duration,
}

impl MonotonicTimePoint {
    /// 由基准偏移构造时间点。
    pub const fn from_offset(offset: Duration) -> Self {
        Self { offset }
    }

    /// 返回距基准时刻的偏移。
    pub const fn as_duration(&self) -> Duration {
        self.offset
    }

    /// 饱和加法，便于叠加超时。
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self {
            offset: self.offset.saturating_add(duration),
        }
    }

    /// 计算与更早时间点之间的差值，早于对方时返回零。
    pub fn saturating_duration_since(&self, earlier: MonotonicTimePoint) -> Duration {
        self.offset.saturating_sub(earlier.offset)
    }
}

/// 截止原语，描述一次操作的最迟完成时刻。
///
/// # 教案式注释
///
/// ## 契约（What）
/// - `Deadline` 可以为空，表示调用方未施加硬超时；
/// - `with_timeout` 以调用方提供的当前时间点叠加时长生成截止点，
///   双方必须来自同一计时源；
/// - `is_expired` 只做比较，不触发取消；检测到超时后是否取消由
///   调用方决定。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Deadline {
    instant: Option<MonotonicTimePoint>,
}

impl Deadline {
    /// 创建未设置截止时间的实例。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 根据绝对时间点构造截止时间。
    pub const fn at(instant: MonotonicTimePoint) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 基于当前时间点加持续时间生成截止时间。
    pub fn with_timeout(now: MonotonicTimePoint, timeout: Duration) -> Self {
        Self::at(now.saturating_add(timeout))
    }

    /// 返回内部时间点，便于与调度器/定时器协作。
    pub const fn instant(&self) -> Option<MonotonicTimePoint> {
        self.instant
    }

    /// 判断在给定的当前时刻是否已经超时。
    pub fn is_expired(&self, now: MonotonicTimePoint) -> bool {
        match self.instant {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// 调用上下文：一次建连/监听激活所拥有的取消范围与截止约束。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 每个建连激活与每个监听激活都拥有自己的取消范围；
///   把取消与截止捆绑成一个值沿流水线向下传递，避免散落的布尔参数；
/// - 服务端为每个被接受的连接派生子上下文，使单个客户端的取消不影响
///   兄弟连接。
///
/// ## 契约（What）
/// - **前置条件**：通过 [`CallContext::builder`] 组装；缺省为
///   “不可取消 + 无截止”，适合测试与简单调用；
/// - **后置条件**：`child` 派生的上下文共享父级取消位，但可以收紧
///   截止时间；放松截止时间不被支持。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    /// 进入构建器。
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    /// 访问取消令牌。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 读取截止时间。
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// 派生共享取消位的子上下文。
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child(),
            deadline: self.deadline,
        }
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ctx(cancelled={}, deadline={:?})",
            self.cancellation.is_cancelled(),
            self.deadline.instant()
        )
    }
}

/// [`CallContext`] 的构建器。
#[derive(Debug, Default)]
pub struct CallContextBuilder {
    cancellation: Option<Cancellation>,
    deadline: Deadline,
}

impl CallContextBuilder {
    /// 指定取消令牌；未指定时将创建全新令牌。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// 指定截止时间。
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// 固化为 [`CallContext`]。
    pub fn build(self) -> CallContext {
        CallContext {
            cancellation: self.cancellation.unwrap_or_default(),
            deadline: self.deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reports_first_transition_only() {
        let cancellation = Cancellation::new();
        let sibling = cancellation.child();
        assert!(!sibling.is_cancelled());
        assert!(cancellation.cancel(), "首次取消应返回 true");
        assert!(!cancellation.cancel(), "重复取消应返回 false");
        assert!(sibling.is_cancelled(), "子令牌共享同一取消位");
    }

    #[test]
    fn deadline_expiry_follows_monotonic_clock() {
        let base = MonotonicTimePoint::from_offset(Duration::from_secs(10));
        let deadline = Deadline::with_timeout(base, Duration::from_secs(5));
        assert!(!deadline.is_expired(base));
        assert!(deadline.is_expired(MonotonicTimePoint::from_offset(Duration::from_secs(15))));
        assert!(!Deadline::none().is_expired(base));
    }

    #[test]
    fn child_context_shares_cancellation() {
        let ctx = CallContext::builder().build();
        let child = ctx.child();
        ctx.cancellation().cancel();
        assert!(child.cancellation().is_cancelled());
    }
}
