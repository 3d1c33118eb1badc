// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-proxy
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capability;
mod egress;
mod socket;

pub use capability::{CapabilityProxy, ProxyHandle};
pub use egress::{
    EGRESS_PERMISSION, EgressProxy, HostResolver, MAX_EGRESS_RESPONSE_BYTES, SystemResolver,
    domain_matches, is_internal_ip, resolve_and_check, validate_request,
};
pub use socket::{SocketOptions, UdsSocketManager};
