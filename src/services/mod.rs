//! Background services
//!
//! - **ServiceManager**: coordinates lifecycle of background services
//! - **AllocationController**: periodic multi-tenant reallocation pass

pub mod controller;
pub mod framework;

pub use controller::{AllocationController, ControllerConfig, ControllerStats};
pub use framework::{RestartPolicy, Service, ServiceError, ServiceManager, ServiceStatus};
