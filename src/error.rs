/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 这样可以让调用者进行更精确的错误处理和恢复
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 隧道服务的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 配置无效
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// 监听失败
    #[error("Failed to listen on {addr}: {source}")]
    ListenFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 端口被占用
    #[error("Port {0} is already in use")]
    PortInUse(u16),

    /// 端口范围耗尽
    #[error("No free port available in range {min}-{max}")]
    PortExhausted { min: u16, max: u16 },

    /// 没有可用的工作连接
    #[error("No work connection available: {0}")]
    WorkConnUnavailable(String),

    /// 协议错误
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// 对端关闭连接
    #[error("Peer closed the connection")]
    PeerClosed,

    /// 超时错误
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// 已取消
    #[error("Operation canceled")]
    Canceled,

    /// 编解码错误
    #[error("Codec error: {0}")]
    InternalCodec(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建配置错误
    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// 创建监听失败错误
    pub fn listen_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ListenFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// 创建编解码错误
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::InternalCodec(msg.into())
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// 检查是否为端口占用错误
    pub fn is_port_in_use(&self) -> bool {
        matches!(self, Self::PortInUse(_))
    }

    /// 检查是否为配置错误
    pub fn is_config_invalid(&self) -> bool {
        matches!(self, Self::ConfigInvalid(_))
    }

    /// 检查是否为对端关闭
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}
