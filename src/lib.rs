/// 隧道服务库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metric;
pub mod msg;
pub mod server;
pub mod udp;

// 重新导出常用类型
pub use config::{ProxyConfig, ProxyKind, ProxyType, ServerEnv};
pub use error::{Result, TunnelError};
pub use msg::{Message, StreamConn, UdpPacket, WorkConn};
pub use server::{run_server, ServerService, StatsCollector};
