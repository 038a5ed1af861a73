//! # libblockcsi: CSI plugin for cloud block storage volumes
//!
//! `libblockcsi` provisions provider block volumes, attaches them to VMs and
//! makes them usable on the node (optionally LUKS-encrypted), speaking a
//! JSON-framed [Container Storage Interface][csi] over a unix or TCP socket.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: volumes, snapshots, capabilities, requests. |
//! | [`error`] | [`CsiError`] and its status codes. |
//! | [`message`] | [`CsiMessage`] protocol envelope. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volumes, attachments, snapshots. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, expand, stats. |
//! | [`service`] | Controller and node services implementing the traits. |
//! | [`driver`] | Identity service and request routing per run mode. |
//! | [`cloud`] | Provider client: raw verbs, signing, retries, polling. |
//! | [`mounter`] | Mount, format and LUKS operations on the node. |
//! | [`inflight`] | Per-resource operation locks. |
//! | [`backoff`] | Retry and polling policy. |
//! | [`config`] | Driver identity and tunables. |
//! | [`transport`] | Socket server and client. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backoff;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod inflight;
pub mod message;
pub mod mounter;
pub mod node;
pub mod service;
pub mod transport;
pub mod types;
pub mod util;

pub use controller::CsiController;
pub use driver::{Driver, Mode};
pub use error::{Code, CsiError};
pub use identity::CsiIdentity;
pub use message::{CsiMessage, CsiRequest};
pub use node::CsiNode;
pub use types::*;
