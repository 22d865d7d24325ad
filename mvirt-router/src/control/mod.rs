//! Control plane: the single thread that owns all mutable routing state.
//!
//! - `api`: request types and handlers
//! - `icmp`: echo request/reply correlation
//! - `output`: worker → control punting channel and its wake thread
//! - `plane`: the control thread event loop and client handle

pub mod api;
pub mod icmp;
pub mod output;
pub mod plane;

pub use api::{ApiPayload, ApiRequest, ApiResponse, ControlState};
pub use icmp::{EchoCorrelator, EchoParams, EchoReply};
pub use output::{ControlOutput, ControlOutputSender, PuntHandler};
pub use plane::{ControlClient, ControlPlane};
