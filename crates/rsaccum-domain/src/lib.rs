//! rsaccum-domain: Core envelope model and payload semantics
//!
//! This crate owns the request envelope consumed from producers and forwarded
//! to callbacks:
//! - `BodyItem` / `RequestData` with verbatim pass-through of unknown fields
//! - the three accepted ingress payload shapes
//! - control-item extraction (`type == "dados"`, first occurrence wins)
//! - the stable reorder that puts the control item first
//! - the persisted `UserBuffer` and `FailedRequestLog` records

pub mod error;
pub mod model;

pub use error::{DomainError, DomainResult};
pub use model::{
    extract_control, parse_request_payload, reorder_control_first, BodyItem, ControlRef,
    FailedRequestLog, RequestData, UserBuffer, CONTROL_TYPE,
};
