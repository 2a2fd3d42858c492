use crate::codec::Message;
use crate::dispatch::{CallbackId, CallbackNotification, CallbackTarget, DispatchSink};
use crate::error::{ErrorCategory, Fault, QuiverError, codes};
use crate::session::{SessionId, SessionRegistry};
use crate::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// 调度器契约：回调通知的执行单元统一经由它投递。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 通知到达在传输自己的线程/上下文里，直接执行会把订阅者代码
///   拉进传输内部；契约要求一律改在调用方指定的调度器上执行；
/// - 契约保持单入口、对象安全，便于用 `Arc<dyn Scheduler>` 注入。
///
/// ## 契约（What）
/// - `schedule` 接收装箱的执行单元，保证其最终在调度器的上下文中
///   运行一次；不承诺多次 `schedule` 之间的相对顺序——逐 id 顺序由
///   通道内部的串行队列保证。
pub trait Scheduler: Send + Sync + 'static {
    /// 投递一个执行单元。
    fn schedule(&self, unit: Box<dyn FnOnce() + Send + 'static>);
}

/// 就地执行的调度器，用于测试与无需线程切换的场景。
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, unit: Box<dyn FnOnce() + Send + 'static>) {
        unit();
    }
}

/// 订阅者契约：三个动作均可失败，失败即触发会话级升级。
///
/// ## 契约（What）
/// - `on_value` 收到一个已解码的值；
/// - `on_fault` 收到远端流的终止故障；
/// - `on_completed` 收到自然完成信号；
/// - 返回 `Err` 表示订阅者自身处理失败——该失败发生在完全脱离
///   调用方的调度上下文中，通道会将其捕获并升级为会话致命故障。
pub trait Observer: Send + 'static {
    /// 订阅的值类型。
    type Item;

    /// 处理一个值。
    fn on_value(&mut self, value: Self::Item) -> Result<()>;

    /// 处理远端故障。
    fn on_fault(&mut self, fault: Fault) -> Result<()>;

    /// 处理完成信号。
    fn on_completed(&mut self) -> Result<()>;
}

/// 双工回调：`{回调 id, 会话标识}` 的纯值对。
///
/// ## 契约（What）
/// - 不持有会话引用；会话经 [`SessionRegistry`] 在使用点解析，
///   因此回调无法延长已拆除会话的生命周期；
/// - 可随意克隆、跨线程传递。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DuplexCallback {
    callback: CallbackId,
    session: SessionId,
}

impl DuplexCallback {
    /// 组合回调 id 与会话标识。
    pub fn new(callback: CallbackId, session: SessionId) -> Self {
        Self { callback, session }
    }

    /// 回调 id。
    pub fn callback_id(&self) -> CallbackId {
        self.callback
    }

    /// 会话标识。
    pub fn session_id(&self) -> SessionId {
        self.session
    }
}

/// 把一个双工回调呈现为本地可观察序列的类型化视图。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 远端以整数 id 标识的值流经会话派发汇到达本地；本类型把
///   “附着 → 调度投递 → 升级/解除”的完整订阅协议封装成一个值；
/// - 通知必须按到达顺序执行且不得阻塞传输线程，所以内部用
///   “逐 id 串行队列”把任意调度器转成顺序执行器。
///
/// ## 逻辑（How）
/// - `subscribe` 经注册表解析派发汇并附着；附着失败（会话已拆除、
///   id 被占用、会话已亡）一律走升级路径，但仍返回惰性的解除句柄，
///   绝不让 `subscribe` 向调用方抛错；
/// - 每条通知入队后，若当前没有在途的执行单元，则向调度器投递一次
///   “排空”任务；排空任务按 FIFO 逐条执行，保证同一 id 的
///   值/故障/完成按到达顺序投递；
/// - 订阅者处理失败被捕获为 [`Fault`]，恰好一次地交给会话的
///   “取消全部通信”；终止通知投递完毕后自动解除附着。
///
/// ## 契约（What）
/// - 除 id、会话标识、注册表与调度器引用外不持有其他状态；
/// - 解除句柄丢弃（或显式 `detach`）后，已入队未执行的通知不再投递。
pub struct DuplexCallbackObservable<T> {
    callback: DuplexCallback,
    registry: Arc<SessionRegistry>,
    scheduler: Arc<dyn Scheduler>,
    decode: Arc<dyn Fn(Message) -> Result<T> + Send + Sync>,
}

impl<T: Send + 'static> DuplexCallbackObservable<T> {
    /// 以解码函数构造类型化视图。
    pub fn new(
        callback: DuplexCallback,
        registry: Arc<SessionRegistry>,
        scheduler: Arc<dyn Scheduler>,
        decode: impl Fn(Message) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            callback,
            registry,
            scheduler,
            decode: Arc::new(decode),
        }
    }

    /// 附着订阅者，返回解除句柄；本方法从不向调用方抛错。
    pub fn subscribe<O>(&self, observer: O) -> DetachHandle
    where
        O: Observer<Item = T>,
    {
        let Some(sink) = self.registry.sink(self.callback.session_id()) else {
            self.escalate_attach_failure(
                QuiverError::new(codes::SESSION_NOT_FOUND, "session not in registry")
                    .with_category(ErrorCategory::SessionFatal),
            );
            return DetachHandle::inert();
        };

        let subscription = Arc::new(Subscription {
            callback: self.callback,
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
            sink: Arc::downgrade(&sink),
            queue: Mutex::new(QueueState::default()),
            detached: AtomicBool::new(false),
            escalated: AtomicBool::new(false),
            work: Mutex::new(Work {
                observer,
                decode: Arc::clone(&self.decode),
            }),
        });

        let target: Arc<dyn CallbackTarget> = {
            let subscription = Arc::clone(&subscription);
            Arc::new(move |notification: CallbackNotification| {
                Subscription::enqueue(&subscription, notification);
            })
        };

        if let Err(error) = sink.attach(self.callback.callback_id(), target) {
            self.escalate_attach_failure(error);
            return DetachHandle::inert();
        }
        DetachHandle {
            inner: Some(subscription),
        }
    }

    fn escalate_attach_failure(&self, error: QuiverError) {
        let fault = Fault::dispatch(
            QuiverError::new(codes::DISPATCH_ATTACH_REJECTED, "callback attach rejected")
                .with_cause(error)
                .with_category(ErrorCategory::SessionFatal),
        );
        match self.registry.control(self.callback.session_id()) {
            Some(control) => {
                control.cancel_all_communication(fault);
            }
            None => {
                tracing::debug!(callback = %self.callback.callback_id(),
                    session = %self.callback.session_id(),
                    "附着失败且会话已亡，无处升级：{fault}");
            }
        }
    }
}

/// 解除句柄：停止调度后续工作并撤销已入队未执行的通知。
///
/// ## 契约（What）
/// - `detach` 与 Drop 等价，幂等且绝不失败；
/// - 惰性句柄（附着失败时返回）解除是空操作。
pub struct DetachHandle {
    inner: Option<Arc<dyn Detachable>>,
}

impl DetachHandle {
    /// 构造什么都不做的惰性句柄。
    pub fn inert() -> Self {
        Self { inner: None }
    }

    /// 显式解除附着。
    pub fn detach(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.detach();
        }
    }

    /// 是否为惰性句柄。
    pub fn is_inert(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for DetachHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.detach();
        }
    }
}

trait Detachable: Send + Sync {
    fn detach(&self);
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<CallbackNotification>,
    drain_scheduled: bool,
}

struct Work<O, T> {
    observer: O,
    decode: Arc<dyn Fn(Message) -> Result<T> + Send + Sync>,
}

struct Subscription<O, T> {
    callback: DuplexCallback,
    registry: Arc<SessionRegistry>,
    scheduler: Arc<dyn Scheduler>,
    sink: std::sync::Weak<DispatchSink>,
    queue: Mutex<QueueState>,
    detached: AtomicBool,
    escalated: AtomicBool,
    work: Mutex<Work<O, T>>,
}

impl<O, T> Subscription<O, T>
where
    O: Observer<Item = T>,
    T: Send + 'static,
{
    fn enqueue(this: &Arc<Self>, notification: CallbackNotification) {
        if this.detached.load(Ordering::Acquire) {
            return;
        }
        let should_schedule = {
            let mut queue = this.lock_queue();
            queue.items.push_back(notification);
            if queue.drain_scheduled {
                false
            } else {
                queue.drain_scheduled = true;
                true
            }
        };
        if should_schedule {
            let subscription = Arc::clone(this);
            this.scheduler
                .schedule(Box::new(move || subscription.drain()));
        }
    }

    /// 逐条排空队列；同一时刻最多存在一个排空任务，保证逐 id 顺序。
    fn drain(&self) {
        loop {
            let notification = {
                let mut queue = self.lock_queue();
                if self.detached.load(Ordering::Acquire) {
                    queue.items.clear();
                    queue.drain_scheduled = false;
                    return;
                }
                match queue.items.pop_front() {
                    Some(notification) => notification,
                    None => {
                        queue.drain_scheduled = false;
                        return;
                    }
                }
            };
            self.execute(notification);
        }
    }

    fn execute(&self, notification: CallbackNotification) {
        let terminal = matches!(
            notification,
            CallbackNotification::Faulted(_) | CallbackNotification::Completed
        );
        let outcome = {
            let mut work = match self.work.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match notification {
                CallbackNotification::Value(message) => (work.decode)(message)
                    .and_then(|value| work.observer.on_value(value)),
                CallbackNotification::Faulted(fault) => work.observer.on_fault(fault),
                CallbackNotification::Completed => work.observer.on_completed(),
            }
        };
        match outcome {
            Ok(()) => {
                if terminal {
                    self.detach();
                }
            }
            Err(error) => self.escalate(error),
        }
    }

    /// 捕获订阅者失败并恰好一次地升级为会话致命故障。
    fn escalate(&self, error: QuiverError) {
        if self.escalated.swap(true, Ordering::AcqRel) {
            return;
        }
        let fault = Fault::dispatch(
            QuiverError::new(codes::CALLBACK_OBSERVER_FAILED, "observer handler failed")
                .with_cause(error)
                .with_category(ErrorCategory::SessionFatal),
        );
        if let Some(control) = self.registry.control(self.callback.session_id()) {
            control.cancel_all_communication(fault);
        } else {
            tracing::debug!(session = %self.callback.session_id(),
                "订阅者失败但会话已亡：{fault}");
        }
        self.detach();
    }

    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<O, T> Detachable for Subscription<O, T>
where
    O: Observer<Item = T>,
    T: Send + 'static,
{
    fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut queue = self.lock_queue();
            queue.items.clear();
        }
        if let Some(sink) = self.sink.upgrade() {
            sink.detach(self.callback.callback_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionControl;
    use crate::test_stubs::{ManualScheduler, RecordingObserver};
    use std::sync::Weak;
    use std::sync::atomic::AtomicUsize;

    struct FatalControl {
        cancelled: AtomicUsize,
        last_code: Mutex<Option<&'static str>>,
    }

    impl FatalControl {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cancelled: AtomicUsize::new(0),
                last_code: Mutex::new(None),
            })
        }
    }

    impl SessionControl for FatalControl {
        fn cancel_all_communication(&self, fault: Fault) -> bool {
            let first = self.cancelled.fetch_add(1, Ordering::SeqCst) == 0;
            *self.last_code.lock().unwrap() = Some(fault.error().code());
            first
        }

        fn is_torn_down(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst) > 0
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        control: Arc<FatalControl>,
        sink: Arc<DispatchSink>,
        session: SessionId,
    }

    fn fixture() -> Fixture {
        let registry = SessionRegistry::new();
        let control = FatalControl::new();
        let sink = DispatchSink::new();
        let session = registry.register(
            Arc::downgrade(&control) as Weak<dyn SessionControl>,
            Arc::downgrade(&sink),
        );
        Fixture {
            registry,
            control,
            sink,
            session,
        }
    }

    fn decode_u32(message: Message) -> crate::Result<u32> {
        let bytes: [u8; 4] = message.payload().as_ref().try_into().map_err(|_| {
            QuiverError::new("quiver.test.decode", "payload not 4 bytes")
                .with_category(ErrorCategory::Execution)
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn value_message(value: u32) -> Message {
        Message::from_payload(value.to_be_bytes().to_vec())
    }

    #[test]
    fn notifications_preserve_arrival_order() {
        let fx = fixture();
        let id = CallbackId(7);
        let observable = DuplexCallbackObservable::new(
            DuplexCallback::new(id, fx.session),
            Arc::clone(&fx.registry),
            Arc::new(InlineScheduler),
            decode_u32,
        );
        let observer = RecordingObserver::new();
        let log = observer.log();
        let _handle = observable.subscribe(observer);

        fx.sink.dispatch(id, CallbackNotification::Value(value_message(42)));
        fx.sink.dispatch(id, CallbackNotification::Value(value_message(43)));
        fx.sink.dispatch(id, CallbackNotification::Completed);

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["value:42", "value:43", "completed"]
        );
        assert_eq!(fx.control.cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observer_failure_escalates_exactly_once() {
        let fx = fixture();
        let id = CallbackId(1);
        let observable = DuplexCallbackObservable::new(
            DuplexCallback::new(id, fx.session),
            Arc::clone(&fx.registry),
            Arc::new(InlineScheduler),
            decode_u32,
        );
        let observer = RecordingObserver::failing_on_value();
        let _handle = observable.subscribe(observer);

        fx.sink.dispatch(id, CallbackNotification::Value(value_message(1)));
        // 升级后附着已解除，后续通知不应再触发第二次升级。
        fx.sink.dispatch(id, CallbackNotification::Value(value_message(2)));

        assert_eq!(fx.control.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(
            *fx.control.last_code.lock().unwrap(),
            Some(codes::CALLBACK_OBSERVER_FAILED)
        );
    }

    #[test]
    fn subscribe_never_throws_on_torn_down_sink() {
        let fx = fixture();
        fx.sink.tear_down();
        let observable = DuplexCallbackObservable::new(
            DuplexCallback::new(CallbackId(9), fx.session),
            Arc::clone(&fx.registry),
            Arc::new(InlineScheduler),
            decode_u32,
        );
        let handle = observable.subscribe(RecordingObserver::new());
        assert!(handle.is_inert());
        assert_eq!(fx.control.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(
            *fx.control.last_code.lock().unwrap(),
            Some(codes::DISPATCH_ATTACH_REJECTED)
        );
    }

    #[test]
    fn subscribe_on_dead_session_returns_inert_handle() {
        let fx = fixture();
        fx.registry.deregister(fx.session);
        let observable = DuplexCallbackObservable::new(
            DuplexCallback::new(CallbackId(2), fx.session),
            Arc::clone(&fx.registry),
            Arc::new(InlineScheduler),
            decode_u32,
        );
        let handle = observable.subscribe(RecordingObserver::new());
        assert!(handle.is_inert());
    }

    #[test]
    fn detach_suppresses_queued_notifications() {
        let fx = fixture();
        let id = CallbackId(4);
        let scheduler = ManualScheduler::new();
        let observable = DuplexCallbackObservable::new(
            DuplexCallback::new(id, fx.session),
            Arc::clone(&fx.registry),
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            decode_u32,
        );
        let observer = RecordingObserver::new();
        let log = observer.log();
        let handle = observable.subscribe(observer);

        fx.sink.dispatch(id, CallbackNotification::Value(value_message(42)));
        fx.sink.dispatch(id, CallbackNotification::Completed);
        assert_eq!(scheduler.pending(), 1, "仅应存在一个排空任务");

        handle.detach();
        scheduler.run_all();

        assert!(log.lock().unwrap().is_empty(), "已解除附着的通知不得投递");
        assert!(!fx.sink.dispatch(id, CallbackNotification::Completed));
    }

    #[test]
    fn completion_detaches_and_frees_id() {
        let fx = fixture();
        let id = CallbackId(6);
        let observable = DuplexCallbackObservable::new(
            DuplexCallback::new(id, fx.session),
            Arc::clone(&fx.registry),
            Arc::new(InlineScheduler),
            decode_u32,
        );
        let observer = RecordingObserver::new();
        let _handle = observable.subscribe(observer);
        fx.sink.dispatch(id, CallbackNotification::Completed);

        // 自然完成后 id 立即可复用。
        let observer = RecordingObserver::new();
        let handle = observable.subscribe(observer);
        assert!(!handle.is_inert());
    }
}
