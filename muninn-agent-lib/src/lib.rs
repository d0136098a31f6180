//! Passive HTTP/1.x capture pipeline.
//!
//! The agent opens an AF_PACKET ring on one interface, installs a classic
//! BPF filter so only IPv4/TCP port-80 frames reach user space, pairs
//! request and response packets per flow without TCP reassembly, resolves
//! the owning PID through an eBPF tracepoint map, and hands completed
//! [`muninn_model::TrafficLog`] records to the uploader.
//!
//! Capture, filtering, and the PID resolver are Linux-only; this crate
//! does not compile for other targets.
#![cfg(target_os = "linux")]

pub mod capture;
pub mod config;
pub mod decode;
pub mod error;
pub mod filter;
pub mod matcher;
pub mod pidmap;
pub mod pipeline;
pub mod report;

pub use capture::{CaptureError, CaptureInfo, Frame, RingCapture};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use matcher::{HttpMatcher, PacketMeta};
pub use pidmap::PidResolver;
pub use pipeline::run;
pub use report::Reporter;
