mod health;
mod visitors;

pub use health::{HealthCheckConfig, HealthCheckMonitor, HealthCheckType, HealthStatus};
pub use visitors::{Visitor, VisitorConfig, VisitorFactory, VisitorManager};
