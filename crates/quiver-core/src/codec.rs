use crate::Result;
use bytes::Bytes;
use std::sync::Arc;

/// 已编码的协议消息：本层只搬运字节，不解释值的线格式。
///
/// ## 契约（What）
/// - `payload` 是编码器产出的完整消息体；
/// - 任意值的序列化/反序列化是外部协作者的职责，本层不涉足。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    /// 以既有负载构造消息。
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// 访问负载。
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// 拆出负载。
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// 消息编解码器：会话所有后续流量的统一翻译口。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 序列化格式由外部协作者决定，会话只需要一个“消息 ↔ 帧负载”
///   的翻译口；
/// - 以对象安全 trait 表达，使会话能以 `Arc<dyn MessageCodec>` 持有
///   而无需泛型传染到整条流水线。
///
/// ## 契约（What）
/// - `encode` 把消息翻译为帧负载；`decode` 做逆向翻译；
/// - 实现必须 `Send + Sync`，同一实例会被读写两个半部并发使用；
/// - 编解码失败以 [`QuiverError`](crate::QuiverError) 表达，由会话
///   决定是否转为协议违例。
pub trait MessageCodec: Send + Sync + 'static {
    /// 编码一条消息。
    fn encode(&self, message: &Message) -> Result<Bytes>;

    /// 解码一帧负载。
    fn decode(&self, frame: Bytes) -> Result<Message>;
}

/// 编解码器工厂：每条物理连接创建一个编解码器实例。
pub trait CodecFactory: Send + Sync + 'static {
    /// 为新连接创建编解码器。
    fn create(&self) -> Arc<dyn MessageCodec>;
}

impl<F> CodecFactory for F
where
    F: Fn() -> Arc<dyn MessageCodec> + Send + Sync + 'static,
{
    fn create(&self) -> Arc<dyn MessageCodec> {
        self()
    }
}
