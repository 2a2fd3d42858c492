use quiver_core::callback::Scheduler;
use tokio::runtime::Handle;

/// 把双工回调的投递单元转投到 Tokio 运行时的调度器适配。
///
/// 执行单元是同步闭包，`spawn_blocking` 会占用阻塞线程池；回调单元
/// 约定为短小的投递动作，直接在工作线程上执行即可。
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// 绑定到当前运行时。必须在运行时上下文内调用。
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    /// 绑定到显式给出的运行时句柄。
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, unit: Box<dyn FnOnce() + Send + 'static>) {
        self.handle.spawn(async move {
            unit();
        });
    }
}
