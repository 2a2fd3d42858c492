use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 严格递增的原子计数器，首个分配值为 1。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 连接编号只用于诊断与关联，但要求在各自作用域内严格递增、唯一、
///   原子分配，即使连接立即失败也不回收；
/// - 以显式类型表达，避免散落的 `static AtomicU64` 形成隐藏的全局单例。
///
/// ## 契约（What）
/// - `next` 每次返回一个新值；N 次并发调用得到 N 个互不相同、构成
///   连续区间的值；
/// - 计数器生命周期与其宿主（进程级注册表或单个监听器）一致。
#[derive(Debug)]
pub struct Counter {
    next: AtomicU64,
}

impl Counter {
    /// 创建首个分配值为 1 的计数器。
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// 原子分配下一个编号。
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// 进程级连接计数注册表：客户端编号与服务器编号两个作用域。
///
/// ## 契约（What）
/// - 注册表应在进程生命周期内存活，并以 `Arc` 注入各连接提供者，
///   而不是藏在模块级静态量里；
/// - “每服务器客户端编号”不在注册表内：每次 Listen 激活创建一个新的
///   [`Counter`]，其作用域即该监听器的生命周期。
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    client: Counter,
    server: Counter,
}

impl ConnectionCounters {
    /// 创建全新的注册表。
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 分配下一个客户端连接编号。
    pub fn next_client(&self) -> u64 {
        self.client.next()
    }

    /// 分配下一个服务器编号。
    pub fn next_server(&self) -> u64 {
        self.server.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread;

    /// N 路并发分配应得到从 1 开始的连续区间，无重复无空洞。
    #[test]
    fn concurrent_allocation_is_unique_and_contiguous() {
        let counters = ConnectionCounters::new();
        let threads = 8;
        let per_thread = 64;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    (0..per_thread)
                        .map(|_| counters.next_client())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            for value in handle.join().expect("线程不应 panic") {
                assert!(seen.insert(value), "编号 {value} 被重复分配");
            }
        }
        let total = (threads * per_thread) as u64;
        assert_eq!(seen.first().copied(), Some(1));
        assert_eq!(seen.last().copied(), Some(total));
        assert_eq!(seen.len() as u64, total);
    }

    /// 客户端与服务器作用域互不影响。
    #[test]
    fn scopes_are_independent() {
        let counters = ConnectionCounters::new();
        assert_eq!(counters.next_client(), 1);
        assert_eq!(counters.next_client(), 2);
        assert_eq!(counters.next_server(), 1);
    }
}
