use core::fmt;
use std::net::SocketAddr;

/// 连接编号所属的作用域。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionScope {
    /// 主动建连的客户端。
    Client,
    /// 监听进程本身。
    Server,
    /// 某台服务器接受的客户端连接，`server` 为宿主服务器编号。
    AcceptedClient { server: u64 },
}

/// 连接身份：角色标签 + 作用域内编号 + 端点，仅用于诊断与日志关联。
///
/// ## 契约（What）
/// - 身份一经构造不可变；
/// - 绝不参与寻址或路由，显示格式也不承诺稳定。
#[derive(Clone, Debug)]
pub struct ConnectionIdentity {
    scope: ConnectionScope,
    number: u64,
    endpoint: SocketAddr,
}

impl ConnectionIdentity {
    /// 客户端连接身份。
    pub fn client(number: u64, endpoint: SocketAddr) -> Self {
        Self {
            scope: ConnectionScope::Client,
            number,
            endpoint,
        }
    }

    /// 服务器（监听器）身份。
    pub fn server(number: u64, endpoint: SocketAddr) -> Self {
        Self {
            scope: ConnectionScope::Server,
            number,
            endpoint,
        }
    }

    /// 被接受的客户端连接身份。
    pub fn accepted_client(server: u64, number: u64, endpoint: SocketAddr) -> Self {
        Self {
            scope: ConnectionScope::AcceptedClient { server },
            number,
            endpoint,
        }
    }

    /// 作用域。
    pub fn scope(&self) -> ConnectionScope {
        self.scope
    }

    /// 作用域内编号。
    pub fn number(&self) -> u64 {
        self.number
    }

    /// 端点。
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            ConnectionScope::Client => write!(f, "client-{}@{}", self.number, self.endpoint),
            ConnectionScope::Server => write!(f, "server-{}@{}", self.number, self.endpoint),
            ConnectionScope::AcceptedClient { server } => {
                write!(f, "server-{}.client-{}@{}", server, self.number, self.endpoint)
            }
        }
    }
}
