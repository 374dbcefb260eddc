/// 控制与工作连接上的协议消息定义
///
/// 所有消息使用长度前缀（4字节大端）+ JSON 编码，
/// 消息类型由 `type` 字段区分。
use crate::error::{Result, TunnelError};
use crate::config::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 单条消息的最大长度
pub const MAX_MSG_SIZE: usize = 10 * 1024 * 1024;

/// 可作为工作/用户连接使用的流
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamConn for T {}

/// 客户端主动拨号到服务器的工作连接
pub type WorkConn = Box<dyn StreamConn>;

/// UDP 数据报的封装消息
///
/// `content` 为原始负载的 base64 编码。服务器在 `remote_addr` 中填入
/// 公网来源地址并保持 `local_addr` 为空；客户端在回程时原样带回
/// `remote_addr`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UdpPacket {
    pub content: String,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

/// 协议消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// 客户端 -> 服务端：打开控制会话
    Login {
        token: String,
        #[serde(default)]
        pool_count: usize,
        #[serde(default)]
        run_id: String,
    },

    /// 服务端 -> 客户端：登录结果
    LoginResp {
        run_id: String,
        #[serde(default)]
        error: String,
    },

    /// 客户端 -> 服务端：注册一个代理
    NewProxy { proxy: ProxyConfig },

    /// 服务端 -> 客户端：代理注册结果
    NewProxyResp {
        proxy_name: String,
        remote_addr: String,
        #[serde(default)]
        error: String,
    },

    /// 客户端 -> 服务端：注销一个代理
    CloseProxy { proxy_name: String },

    /// 心跳
    Ping,

    /// 心跳响应
    Pong,

    /// 服务端 -> 客户端：请求客户端拨出一条新的工作连接
    ReqWorkConn,

    /// 客户端 -> 服务端：新工作连接的首条消息，声明归属的会话
    NewWorkConn { run_id: String },

    /// 服务端 -> 客户端：工作连接配对完成后的首条消息
    StartWorkConn { proxy_name: String },

    /// UDP 代理工作连接上的数据报
    UdpPacket(UdpPacket),

    /// 服务端 -> 代理所属客户端：打洞会话 id
    NatHoleSid { sid: String },

    /// 客户端 -> 服务端：打洞探测成功
    NatHoleClientDetectOk,
}

/// 读取一条完整消息
pub async fn read_msg<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_read_err)?;
    let msg_len = u32::from_be_bytes(len_buf) as usize;

    if msg_len > MAX_MSG_SIZE {
        return Err(TunnelError::protocol(format!(
            "message too large: {} bytes",
            msg_len
        )));
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader.read_exact(&mut msg_buf).await.map_err(map_read_err)?;

    serde_json::from_slice(&msg_buf).map_err(|e| TunnelError::codec(e.to_string()))
}

/// 写入一条完整消息
pub async fn write_msg<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg).map_err(|e| TunnelError::codec(e.to_string()))?;
    let len_bytes = (body.len() as u32).to_be_bytes();

    writer.write_all(&len_bytes).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn map_read_err(e: io::Error) -> TunnelError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TunnelError::PeerClosed
    } else {
        TunnelError::Io(e)
    }
}
