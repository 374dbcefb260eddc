use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, TunnelError};

/// 代理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Tcp,
    Udp,
    Http,
    Https,
    Xtcp,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Udp => "udp",
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Xtcp => "xtcp",
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TCP 代理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpProxyConfig {
    /// 服务器上暴露的端口，0 表示自动分配
    #[serde(default)]
    pub remote_port: u16,
}

/// UDP 代理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpProxyConfig {
    /// 服务器上暴露的端口，0 表示从配置的范围自动分配
    #[serde(default)]
    pub remote_port: u16,
}

/// HTTP 代理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProxyConfig {
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub sub_domain: String,
    /// URL 前缀路由，为空时匹配所有路径
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub http_user: String,
    #[serde(default)]
    pub http_pwd: String,
    /// 重写转发请求的 Host 头
    #[serde(default)]
    pub host_header_rewrite: String,
    /// 附加到转发请求上的头
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub route_by_http_user: bool,
}

/// HTTPS 代理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpsProxyConfig {
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub sub_domain: String,
}

/// XTCP 代理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XtcpProxyConfig {
    /// 访问者必须出示的共享密钥
    pub sk: String,
}

/// 代理变体配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "proxy_type", rename_all = "lowercase")]
pub enum ProxyKind {
    Tcp(TcpProxyConfig),
    Udp(UdpProxyConfig),
    Http(HttpProxyConfig),
    Https(HttpsProxyConfig),
    Xtcp(XtcpProxyConfig),
}

/// 一个代理的完整配置（客户端注册时提交）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 代理名称，同一客户端内唯一
    pub name: String,
    /// 工作连接是否加密
    #[serde(default)]
    pub use_encryption: bool,
    /// 工作连接是否压缩
    #[serde(default)]
    pub use_compression: bool,
    #[serde(flatten)]
    pub kind: ProxyKind,
}

impl ProxyConfig {
    pub fn proxy_type(&self) -> ProxyType {
        match &self.kind {
            ProxyKind::Tcp(_) => ProxyType::Tcp,
            ProxyKind::Udp(_) => ProxyType::Udp,
            ProxyKind::Http(_) => ProxyType::Http,
            ProxyKind::Https(_) => ProxyType::Https,
            ProxyKind::Xtcp(_) => ProxyType::Xtcp,
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self, env: &ServerEnv) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TunnelError::config_invalid("proxy name cannot be empty"));
        }

        match &self.kind {
            ProxyKind::Http(cfg) => {
                validate_domains(&self.name, &cfg.custom_domains, &cfg.sub_domain, env)?;
            }
            ProxyKind::Https(cfg) => {
                validate_domains(&self.name, &cfg.custom_domains, &cfg.sub_domain, env)?;
            }
            ProxyKind::Xtcp(cfg) => {
                if cfg.sk.is_empty() {
                    return Err(TunnelError::config_invalid(format!(
                        "proxy '{}': sk cannot be empty",
                        self.name
                    )));
                }
            }
            ProxyKind::Tcp(_) | ProxyKind::Udp(_) => {}
        }
        Ok(())
    }
}

fn validate_domains(
    name: &str,
    custom_domains: &[String],
    sub_domain: &str,
    env: &ServerEnv,
) -> Result<()> {
    if custom_domains.iter().all(|d| d.is_empty()) && sub_domain.is_empty() {
        return Err(TunnelError::config_invalid(format!(
            "proxy '{}': custom_domains or sub_domain is required",
            name
        )));
    }
    if !sub_domain.is_empty() {
        if env.subdomain_host.is_empty() {
            return Err(TunnelError::config_invalid(format!(
                "proxy '{}': sub_domain is not supported because subdomain_host is not configured",
                name
            )));
        }
        if sub_domain.contains('.') || sub_domain.contains('*') {
            return Err(TunnelError::config_invalid(format!(
                "proxy '{}': '.' and '*' are not allowed in sub_domain",
                name
            )));
        }
    }
    Ok(())
}

/// 服务器运行环境
///
/// 取代全局配置：由顶层服务持有，传递给每个代理的构造函数。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnv {
    /// 控制连接监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 控制连接监听端口
    pub bind_port: u16,
    /// 代理公网监听地址
    #[serde(default = "default_bind_addr")]
    pub proxy_bind_addr: String,
    /// HTTP vhost 端口
    #[serde(default = "default_vhost_http_port")]
    pub vhost_http_port: u16,
    /// HTTPS vhost 端口
    #[serde(default = "default_vhost_https_port")]
    pub vhost_https_port: u16,
    /// 子域名代理使用的根域名
    #[serde(default)]
    pub subdomain_host: String,
    /// 客户端认证密钥
    pub auth_token: String,
    /// UDP 代理可分配的端口范围起点
    #[serde(default = "default_udp_port_start")]
    pub udp_port_start: u16,
    /// UDP 代理可分配的端口范围终点（含）
    #[serde(default = "default_udp_port_end")]
    pub udp_port_end: u16,
    /// 每个客户端预热的工作连接数上限
    #[serde(default = "default_max_pool_count")]
    pub max_pool_count: usize,
    /// 等待工作连接的超时（秒）
    #[serde(default = "default_user_conn_timeout")]
    pub user_conn_timeout: u64,
    /// 控制连接心跳超时（秒）
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// 是否启用 XTCP 打洞协调
    #[serde(default = "default_true")]
    pub enable_nat_hole: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_vhost_http_port() -> u16 {
    80
}

fn default_vhost_https_port() -> u16 {
    443
}

fn default_udp_port_start() -> u16 {
    20000
}

fn default_udp_port_end() -> u16 {
    25000
}

fn default_max_pool_count() -> usize {
    5
}

fn default_user_conn_timeout() -> u64 {
    10
}

fn default_heartbeat_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

impl Default for ServerEnv {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: 7000,
            proxy_bind_addr: default_bind_addr(),
            vhost_http_port: default_vhost_http_port(),
            vhost_https_port: default_vhost_https_port(),
            subdomain_host: String::new(),
            auth_token: String::new(),
            udp_port_start: default_udp_port_start(),
            udp_port_end: default_udp_port_end(),
            max_pool_count: default_max_pool_count(),
            user_conn_timeout: default_user_conn_timeout(),
            heartbeat_timeout: default_heartbeat_timeout(),
            enable_nat_hole: default_true(),
        }
    }
}

impl ServerEnv {
    /// 验证服务器配置
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.trim().is_empty() {
            return Err(TunnelError::config_invalid("bind_addr cannot be empty"));
        }
        if self.bind_port == 0 {
            return Err(TunnelError::config_invalid("bind_port cannot be 0"));
        }
        if self.udp_port_start > self.udp_port_end {
            return Err(TunnelError::config_invalid(format!(
                "invalid udp port range {}-{}",
                self.udp_port_start, self.udp_port_end
            )));
        }
        Ok(())
    }

    /// 从 TOML 文件加载服务器配置
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct ServerEnvWrapper {
            server: ServerEnv,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        let wrapper: ServerEnvWrapper =
            toml::from_str(&content).context("Failed to parse server configuration")?;
        wrapper
            .server
            .validate()
            .context("Server configuration validation failed")?;
        Ok(wrapper.server)
    }
}
