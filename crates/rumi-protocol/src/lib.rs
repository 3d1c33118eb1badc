// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod types;

pub use codec::{FrameError, MAX_FRAME_BYTES, read_frame, write_frame};
pub use types::{
    CapabilityRequest, CapabilityResponse, DEFAULT_TIMEOUT_SECS, EgressRequest, EgressResponse,
    MAX_TIMEOUT_SECS, clamp_timeout,
};
