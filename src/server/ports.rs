/// UDP 公网端口管理器
///
/// 端口分配的唯一权威：代理先从这里拿到端口再去监听。
/// 指定端口时要么拿到该端口要么失败；端口为 0 时从配置的范围内
/// 轮转分配。
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, TunnelError};

pub struct UdpPortManager {
    min: u16,
    max: u16,
    state: Mutex<PortState>,
}

struct PortState {
    /// port -> 持有者代理名
    used: HashMap<u16, String>,
    /// 自动分配的轮转游标
    cursor: u16,
}

impl UdpPortManager {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            state: Mutex::new(PortState {
                used: HashMap::new(),
                cursor: min,
            }),
        }
    }

    /// 分配端口
    ///
    /// `port > 0` 时只尝试该端口；`port == 0` 时从范围内找一个空闲的。
    pub fn acquire(&self, name: &str, port: u16) -> Result<u16> {
        let mut state = self.state.lock().unwrap();

        if port > 0 {
            if port < self.min || port > self.max {
                return Err(TunnelError::config_invalid(format!(
                    "port {} is not in the allowed range {}-{}",
                    port, self.min, self.max
                )));
            }
            if state.used.contains_key(&port) {
                return Err(TunnelError::PortInUse(port));
            }
            state.used.insert(port, name.to_string());
            return Ok(port);
        }

        let span = (self.max - self.min) as u32 + 1;
        let start = state.cursor;
        for i in 0..span {
            let candidate = self.min + ((start - self.min) as u32 + i).rem_euclid(span) as u16;
            if !state.used.contains_key(&candidate) {
                state.used.insert(candidate, name.to_string());
                state.cursor = if candidate == self.max {
                    self.min
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
        }

        Err(TunnelError::PortExhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// 归还端口
    pub fn release(&self, port: u16) {
        self.state.lock().unwrap().used.remove(&port);
    }

    /// 当前被占用的端口数
    pub fn used_count(&self) -> usize {
        self.state.lock().unwrap().used.len()
    }
}
