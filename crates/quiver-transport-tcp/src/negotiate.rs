use crate::error::{HANDSHAKE_RECV, HANDSHAKE_SEND, handshake_violation};
use crate::io::drive;
use crate::session::{Session, SessionStream};
use quiver_core::codec::MessageCodec;
use quiver_core::contract::{CallContext, Cancellation};
use quiver_core::error::QuiverError;
use quiver_core::identity::ConnectionIdentity;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 占位握手令牌。活性探测值，不承载版本或能力信息。
///
/// TODO: 换成 magic + 版本 + 特性位的真实协商协议，并定义显式的
/// 拒绝码；当前的回显探测只能证明对端在帧边界上是活的。
pub const HANDSHAKE_TOKEN: u32 = 123;

fn token_bytes() -> [u8; 4] {
    HANDSHAKE_TOKEN.to_ne_bytes()
}

/// 客户端协商：回显握手成功后把字节流、编解码器与取消范围
/// 包装为会话。
///
/// ## 契约（What）
/// - 回显与发送值逐字节相等才产生会话；
/// - 不相等返回握手违例错误（协议违例类别，根因携带双方字节）；
/// - 任何 IO 错误、取消或违例都不会产生部分构造的会话，
///   字节流随错误返回被丢弃。
pub(crate) async fn negotiate_client(
    ctx: &CallContext,
    mut stream: Box<dyn SessionStream>,
    codec: Arc<dyn MessageCodec>,
    cancellation: Cancellation,
    identity: ConnectionIdentity,
    max_frame: usize,
) -> Result<Arc<Session>, QuiverError> {
    exchange_client(ctx, &mut *stream).await?;
    tracing::debug!(identity = %identity, "客户端握手完成");
    Ok(Session::new(stream, codec, cancellation, identity, max_frame))
}

/// 服务端协商：读取 4 字节并原样回显，然后包装会话。
///
/// 回显即协议的全部内容；是否相等由客户端裁决，服务端不做校验。
pub(crate) async fn negotiate_server(
    ctx: &CallContext,
    mut stream: Box<dyn SessionStream>,
    codec: Arc<dyn MessageCodec>,
    cancellation: Cancellation,
    identity: ConnectionIdentity,
    max_frame: usize,
) -> Result<Arc<Session>, QuiverError> {
    exchange_server(ctx, &mut *stream).await?;
    tracing::debug!(identity = %identity, "服务端握手完成");
    Ok(Session::new(stream, codec, cancellation, identity, max_frame))
}

async fn exchange_client<S>(ctx: &CallContext, stream: &mut S) -> Result<(), QuiverError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + ?Sized,
{
    let sent = token_bytes();
    drive(ctx, HANDSHAKE_SEND, async {
        stream.write_all(&sent).await?;
        stream.flush().await
    })
    .await?;

    let mut received = [0u8; 4];
    drive(ctx, HANDSHAKE_RECV, stream.read_exact(&mut received)).await?;
    if received != sent {
        return Err(handshake_violation(sent, received));
    }
    Ok(())
}

async fn exchange_server<S>(ctx: &CallContext, stream: &mut S) -> Result<(), QuiverError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + ?Sized,
{
    let mut received = [0u8; 4];
    drive(ctx, HANDSHAKE_RECV, stream.read_exact(&mut received)).await?;
    drive(ctx, HANDSHAKE_SEND, async {
        stream.write_all(&received).await?;
        stream.flush().await
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HANDSHAKE_VIOLATION_CODE;
    use quiver_core::error::ErrorCategory;
    use quiver_core::session::SessionControl;
    use quiver_core::test_stubs::IdentityCodec;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn identity(number: u64) -> ConnectionIdentity {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        ConnectionIdentity::client(number, addr)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_and_server_complete_round_trip() -> anyhow::Result<()> {
        let (client, server) = tokio::io::duplex(64);
        let server_task = tokio::spawn(async move {
            let ctx = CallContext::builder().build();
            negotiate_server(
                &ctx,
                Box::new(server),
                Arc::new(IdentityCodec),
                Cancellation::new(),
                identity(2),
                1024,
            )
            .await
        });
        let ctx = CallContext::builder().build();
        let session = negotiate_client(
            &ctx,
            Box::new(client),
            Arc::new(IdentityCodec),
            Cancellation::new(),
            identity(1),
            1024,
        )
        .await?;
        assert!(!session.is_torn_down());
        server_task.await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatched_echo_is_handshake_violation() -> anyhow::Result<()> {
        let (client, mut rogue) = tokio::io::duplex(64);
        let rogue_task = tokio::spawn(async move {
            // 伪造的对端：吞掉令牌并回一个不同的值。
            let mut sink = [0u8; 4];
            rogue.read_exact(&mut sink).await?;
            rogue.write_all(&7u32.to_ne_bytes()).await?;
            Ok::<_, std::io::Error>(())
        });
        let ctx = CallContext::builder().build();
        let error = negotiate_client(
            &ctx,
            Box::new(client),
            Arc::new(IdentityCodec),
            Cancellation::new(),
            identity(1),
            1024,
        )
        .await
        .unwrap_err();
        assert_eq!(error.code(), HANDSHAKE_VIOLATION_CODE);
        assert_eq!(error.category(), ErrorCategory::ProtocolViolation);
        rogue_task.await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_context_aborts_before_sending() -> anyhow::Result<()> {
        let (client, _server) = tokio::io::duplex(64);
        let ctx = CallContext::builder().build();
        ctx.cancellation().cancel();
        let error = negotiate_client(
            &ctx,
            Box::new(client),
            Arc::new(IdentityCodec),
            Cancellation::new(),
            identity(1),
            1024,
        )
        .await
        .unwrap_err();
        assert_eq!(error.category(), ErrorCategory::Cancelled);
        Ok(())
    }
}
