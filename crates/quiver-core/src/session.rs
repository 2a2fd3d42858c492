use crate::Fault;
use crate::dispatch::DispatchSink;
use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// 会话终止的枚举分类。
///
/// ## 契约（What）
/// - `None`：会话尚未终止或无法归类；
/// - `NegotiationCancelled` / `NegotiationError`：协商期即告终，未产生
///   可用会话，由监听流水线代为归类；
/// - `ExecutionCancelled`：执行期被显式取消，按正常终止对待；
/// - `SessionFatal`：双工回调升级触发“取消全部通信”；
/// - `Completed`：执行自然完成。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ShutdownReason {
    #[default]
    None,
    NegotiationCancelled,
    NegotiationError,
    ExecutionCancelled,
    SessionFatal,
    Completed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownReason::None => "none",
            ShutdownReason::NegotiationCancelled => "negotiation-cancelled",
            ShutdownReason::NegotiationError => "negotiation-error",
            ShutdownReason::ExecutionCancelled => "execution-cancelled",
            ShutdownReason::SessionFatal => "session-fatal",
            ShutdownReason::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// 会话的控制面契约：故障升级与拆除状态查询。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 双工回调通道只需要会话的两种能力——“取消全部通信”与
///   “是否已拆除”——以 trait 切出最小面，使核心 crate 不依赖任何
///   具体传输实现；
/// - 升级必须幂等可判定：契约要求“恰好一次地以捕获的故障调用
///   取消操作”，首次调用返回 `true` 是实现该语义的判定依据。
///
/// ## 契约（What）
/// - `cancel_all_communication`：记录故障、标记会话致命并切断后续
///   IO；返回 `true` 表示本次调用赢得首次拆除权；
/// - `is_torn_down`：查询会话是否已不可再用。
pub trait SessionControl: Send + Sync + 'static {
    /// 以捕获的故障拆除整个会话。
    fn cancel_all_communication(&self, fault: Fault) -> bool;

    /// 会话是否已被拆除。
    fn is_torn_down(&self) -> bool;
}

/// 会话标识，在注册表作用域内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// 原始数值，仅用于日志。
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

struct SessionEntry {
    control: Weak<dyn SessionControl>,
    sink: Weak<DispatchSink>,
}

/// 会话注册表：以弱引用解析会话，供按值传递的回调在使用点查找。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 回调类型要求建模为 `{id, 会话标识}`，会话引用在使用点通过注册表
///   解析而非强持有，否则回调会把已拆除的会话钉在内存里；
/// - 客户端与服务端流水线在会话协商成功后注册，流水线收尾时注销，
///   与“会话恰好销毁一次”的生命周期对齐。
///
/// ## 逻辑（How）
/// - 互斥表保存 `Weak` 对；`lookup` 时 `upgrade`，失败即视为会话已亡；
/// - 标识由内部原子计数器分配，进程内不复用。
///
/// ## 契约（What）
/// - `register` 返回新分配的 [`SessionId`]；
/// - `control`/`sink` 在会话已注销或已被释放时返回 `None`，调用方据此
///   走“附着失败 → 升级”或“静默丢弃”分支。
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    /// 创建空注册表。
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册一个会话的控制面与派发汇，返回其标识。
    pub fn register(
        &self,
        control: Weak<dyn SessionControl>,
        sink: Weak<DispatchSink>,
    ) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut entries = lock_entries(&self.entries);
        entries.insert(id, SessionEntry { control, sink });
        id
    }

    /// 注销会话；重复注销是无害的。
    pub fn deregister(&self, id: SessionId) {
        let mut entries = lock_entries(&self.entries);
        entries.remove(&id);
    }

    /// 解析会话控制面。
    pub fn control(&self, id: SessionId) -> Option<Arc<dyn SessionControl>> {
        let entries = lock_entries(&self.entries);
        entries.get(&id).and_then(|entry| entry.control.upgrade())
    }

    /// 解析会话的派发汇。
    pub fn sink(&self, id: SessionId) -> Option<Arc<DispatchSink>> {
        let entries = lock_entries(&self.entries);
        entries.get(&id).and_then(|entry| entry.sink.upgrade())
    }

    /// 当前在册会话数，仅用于诊断。
    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_entries<'a>(
    entries: &'a Mutex<HashMap<SessionId, SessionEntry>>,
) -> std::sync::MutexGuard<'a, HashMap<SessionId, SessionEntry>> {
    match entries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
