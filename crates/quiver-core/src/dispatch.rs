use crate::codec::Message;
use crate::error::{ErrorCategory, Fault, QuiverError, codes};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// 双工回调标识：在单个会话内唯一的整数 id。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u32);

impl core::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "callback-{}", self.0)
    }
}

/// 派发给某个回调 id 的一条通知。
#[derive(Debug)]
pub enum CallbackNotification {
    /// 远端流产出一个值（仍为编码态，解码由订阅方提供）。
    Value(Message),
    /// 远端流以故障终止。
    Faulted(Fault),
    /// 远端流自然完成。
    Completed,
}

/// 附着在某个 id 下的本地动作集合。
///
/// ## 契约（What）
/// - 三个动作由传输在其自身线程/上下文中按到达顺序调用；
/// - 实现负责把执行转移到调度器上，本层不做任何缓冲。
pub trait CallbackTarget: Send + Sync + 'static {
    /// 投递一条通知。
    fn deliver(&self, notification: CallbackNotification);
}

impl<F> CallbackTarget for F
where
    F: Fn(CallbackNotification) + Send + Sync + 'static,
{
    fn deliver(&self, notification: CallbackNotification) {
        self(notification)
    }
}

/// 每会话的派发汇：按整数 id 把远端值流的通知交给本地附着者。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 一条会话可同时承载多个远端标识的值流；派发汇是它们与本地
///   订阅者之间唯一的汇合点；
/// - 会话拆除后必须拒绝新附着（订阅方据此走升级分支），而对
///   已解除附着的 id 的迟到通知应被静默丢弃，不得惊扰其他 id。
///
/// ## 逻辑（How）
/// - 互斥表保存 `id → target`；`tear_down` 置原子标志并清空表；
/// - `dispatch` 在持锁期间取出目标的 `Arc` 克隆后立即放锁，再调用
///   `deliver`，避免附着者在回调里再进该锁造成死锁。
///
/// ## 契约（What）
/// - `attach`：id 已占用返回 `DISPATCH_ID_OCCUPIED`；汇已拆除返回
///   `SESSION_TORN_DOWN`；
/// - `detach`：显式解除后该 id 可被复用；重复解除无害；
/// - `dispatch`：无人附着时丢弃并返回 `false`。
#[derive(Default)]
pub struct DispatchSink {
    targets: Mutex<HashMap<CallbackId, Arc<dyn CallbackTarget>>>,
    torn_down: AtomicBool,
}

impl DispatchSink {
    /// 创建空的派发汇。
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 在 `id` 下附着一个目标。
    pub fn attach(&self, id: CallbackId, target: Arc<dyn CallbackTarget>) -> Result<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(QuiverError::new(
                codes::SESSION_TORN_DOWN,
                "dispatch sink already torn down",
            )
            .with_category(ErrorCategory::SessionFatal));
        }
        let mut targets = self.lock_targets();
        if targets.contains_key(&id) {
            return Err(QuiverError::new(
                codes::DISPATCH_ID_OCCUPIED,
                format!("{id} already attached"),
            )
            .with_category(ErrorCategory::NonRetryable));
        }
        targets.insert(id, target);
        Ok(())
    }

    /// 解除 `id` 的附着；之后该 id 可被复用。
    pub fn detach(&self, id: CallbackId) {
        let mut targets = self.lock_targets();
        targets.remove(&id);
    }

    /// 向 `id` 投递一条通知；返回是否有人接收。
    pub fn dispatch(&self, id: CallbackId, notification: CallbackNotification) -> bool {
        let target = {
            let targets = self.lock_targets();
            targets.get(&id).cloned()
        };
        match target {
            Some(target) => {
                target.deliver(notification);
                true
            }
            None => {
                tracing::trace!(callback = %id, "丢弃无人附着的通知");
                false
            }
        }
    }

    /// 拆除派发汇：拒绝后续附着并移除现有附着。
    pub fn tear_down(&self) {
        self.torn_down.store(true, Ordering::Release);
        let mut targets = self.lock_targets();
        targets.clear();
    }

    /// 汇是否已拆除。
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    fn lock_targets(&self) -> MutexGuard<'_, HashMap<CallbackId, Arc<dyn CallbackTarget>>> {
        match self.targets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_target(counter: Arc<AtomicUsize>) -> Arc<dyn CallbackTarget> {
        Arc::new(move |_notification: CallbackNotification| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn id_is_exclusive_until_detached() {
        let sink = DispatchSink::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = CallbackId(7);

        sink.attach(id, counting_target(Arc::clone(&counter)))
            .expect("首次附着成功");
        let occupied = sink
            .attach(id, counting_target(Arc::clone(&counter)))
            .expect_err("重复附着必须失败");
        assert_eq!(occupied.code(), codes::DISPATCH_ID_OCCUPIED);

        sink.detach(id);
        sink.attach(id, counting_target(counter))
            .expect("显式解除后 id 可复用");
    }

    #[test]
    fn dispatch_after_detach_is_dropped() {
        let sink = DispatchSink::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = CallbackId(3);
        sink.attach(id, counting_target(Arc::clone(&counter))).unwrap();

        assert!(sink.dispatch(id, CallbackNotification::Completed));
        sink.detach(id);
        assert!(!sink.dispatch(id, CallbackNotification::Completed));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn torn_down_sink_rejects_attach() {
        let sink = DispatchSink::new();
        sink.tear_down();
        let counter = Arc::new(AtomicUsize::new(0));
        let err = sink
            .attach(CallbackId(1), counting_target(counter))
            .expect_err("拆除后的汇必须拒绝附着");
        assert_eq!(err.code(), codes::SESSION_TORN_DOWN);
        assert!(sink.is_torn_down());
    }
}
