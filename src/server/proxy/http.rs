use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{BaseProxy, Proxy};
use crate::config::{HttpProxyConfig, ProxyType};
use crate::error::Result;
use crate::server::vhost::{canonical_addr, VhostRouteConfig};

/// HTTP 代理：对 customDomains ∪ subDomain 的每个域名、每个
/// location 前缀向 vhost 复用器注册一条路由
pub struct HttpProxy {
    base: Arc<BaseProxy>,
    cfg: HttpProxyConfig,
}

impl HttpProxy {
    pub fn new(base: Arc<BaseProxy>, cfg: HttpProxyConfig) -> Self {
        Self { base, cfg }
    }

    fn route_template(&self) -> VhostRouteConfig {
        VhostRouteConfig {
            domain: String::new(),
            location: String::new(),
            http_user: self.cfg.http_user.clone(),
            http_pwd: self.cfg.http_pwd.clone(),
            rewrite_host: self.cfg.host_header_rewrite.clone(),
            headers: self.cfg.headers.clone(),
            route_by_http_user: self.cfg.route_by_http_user,
        }
    }

    fn listen_domain(&self, route: &mut VhostRouteConfig, domain: &str) -> Result<()> {
        route.domain = domain.to_string();
        let default_locations = [String::new()];
        let locations: &[String] = if self.cfg.locations.is_empty() {
            &default_locations
        } else {
            &self.cfg.locations
        };

        for location in locations {
            route.location = location.clone();
            let mut listener = self.base.rc.vhost_http_muxer.listen(route)?;
            listener.add_log_prefix(&self.base.name);
            info!(
                "http proxy '{}' listen for host [{}] location [{}]",
                self.base.name, route.domain, route.location
            );
            self.base.clone().start_vhost_listen_handler(listener);
        }
        Ok(())
    }
}

#[async_trait]
impl Proxy for HttpProxy {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Http
    }

    async fn run(self: Arc<Self>) -> Result<String> {
        let mut route = self.route_template();
        let mut addrs = Vec::new();

        for domain in self.cfg.custom_domains.clone() {
            if domain.is_empty() {
                continue;
            }
            self.listen_domain(&mut route, &domain)?;
            addrs.push(canonical_addr(&domain, self.base.env.vhost_http_port));
        }

        if !self.cfg.sub_domain.is_empty() {
            let domain = format!("{}.{}", self.cfg.sub_domain, self.base.env.subdomain_host);
            self.listen_domain(&mut route, &domain)?;
            addrs.push(canonical_addr(&domain, self.base.env.vhost_http_port));
        }

        Ok(addrs.join(","))
    }

    async fn close(&self) {
        self.base.close_base().await;
    }
}
