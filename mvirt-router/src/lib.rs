//! Software packet router: graph dataplane, nexthop/label directory and a
//! single control thread fed by a lock-free punting channel.

pub mod config;
pub mod control;
pub mod dataplane;
pub mod nexthop;
pub mod ping;
pub mod router;
pub mod routing;
pub mod test_util;

pub use config::{ConfigError, InterfaceConfig, RouterConfig};
pub use router::{Port, Router, RouterError};
