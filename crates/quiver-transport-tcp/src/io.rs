use crate::error::{OperationKind, cancelled_error, map_io_error, timeout_error};
use quiver_core::contract::{CallContext, Cancellation, Deadline, MonotonicTimePoint};
use quiver_core::QuiverError;
use std::future::Future;
use std::io;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::time::Instant as TokioInstant;

/// 取消位的轮询间隔。协作式取消没有通知机制，挂起的 IO 依赖
/// 定时轮询感知取消，因此取消响应存在毫秒级延迟。
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

fn monotonic_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

/// 当前的单调时间点，供 [`Deadline`] 比较使用。
pub(crate) fn monotonic_now() -> MonotonicTimePoint {
    MonotonicTimePoint::from_offset(Instant::now().duration_since(monotonic_base()))
}

/// 判断截止时间是否已经过期。
pub(crate) fn deadline_expired(deadline: Deadline) -> bool {
    deadline.is_expired(monotonic_now())
}

fn to_tokio_deadline(deadline: Deadline) -> Option<TokioInstant> {
    deadline
        .instant()
        .map(|instant| TokioInstant::from_std(monotonic_base() + instant.as_duration()))
}

async fn wait_for_cancellation(cancellation: &Cancellation) {
    while !cancellation.is_cancelled() {
        tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
    }
}

/// 在保留取消/超时语义的前提下驱动一个 IO Future。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 建连、接受与握手收发都是挂起点，必须统一感知 [`CallContext`]
///   的取消与截止，否则资源释放无法确定性发生；
/// - 底层完成可能内联发生（future 首次 poll 即就绪）也可能延迟到达，
///   `select!` 保证三个信号——取消、截止、IO 完成——只有第一个被
///   采纳，落败者被忽略，既不丢失内联完成也不会重复触发。
///
/// ## 契约（What）
/// - 进入时先做一次快速检查：截止已过返回超时错误，已取消返回取消
///   错误，IO Future 不会被 poll；
/// - 返回值三选一：取消错误、超时错误，或 IO 结果（错误经
///   [`map_io_error`] 保留原生根因）。
pub(crate) async fn drive<F, T>(
    ctx: &CallContext,
    kind: OperationKind,
    future: F,
) -> Result<T, QuiverError>
where
    F: Future<Output = io::Result<T>>,
{
    if deadline_expired(ctx.deadline()) {
        return Err(timeout_error(kind));
    }
    if ctx.cancellation().is_cancelled() {
        return Err(cancelled_error(kind));
    }

    let cancel = wait_for_cancellation(ctx.cancellation());
    tokio::pin!(cancel);
    tokio::pin!(future);

    match to_tokio_deadline(ctx.deadline()) {
        Some(deadline) => {
            let expiry = tokio::time::sleep_until(deadline);
            tokio::pin!(expiry);
            tokio::select! {
                biased;
                _ = &mut cancel => Err(cancelled_error(kind)),
                _ = &mut expiry => Err(timeout_error(kind)),
                result = &mut future => result.map_err(|error| map_io_error(kind, error)),
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = &mut cancel => Err(cancelled_error(kind)),
                result = &mut future => result.map_err(|error| map_io_error(kind, error)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CONNECT;
    use quiver_core::error::ErrorCategory;

    #[tokio::test]
    async fn pre_cancelled_context_skips_io() {
        let ctx = CallContext::builder().build();
        ctx.cancellation().cancel();
        let result = drive(&ctx, CONNECT, async {
            panic!("已取消的上下文不应 poll IO future")
        })
        .await
        .map(|_: ()| ());
        assert_eq!(result.unwrap_err().category(), ErrorCategory::Cancelled);
    }

    #[tokio::test]
    async fn inline_completion_is_taken_once() {
        let ctx = CallContext::builder().build();
        let value = drive(&ctx, CONNECT, async { Ok(42u32) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_maps_to_timeout() {
        let deadline = Deadline::with_timeout(monotonic_now(), Duration::from_millis(10));
        let ctx = CallContext::builder().with_deadline(deadline).build();
        let result = drive(&ctx, CONNECT, std::future::pending::<io::Result<()>>()).await;
        assert_eq!(result.unwrap_err().category(), ErrorCategory::Timeout);
    }

    #[tokio::test]
    async fn cancellation_wins_while_suspended() {
        let ctx = CallContext::builder().build();
        let cancellation = ctx.cancellation().child();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancellation.cancel();
        });
        let result = drive(&ctx, CONNECT, std::future::pending::<io::Result<()>>()).await;
        assert_eq!(result.unwrap_err().category(), ErrorCategory::Cancelled);
    }
}
