//! # rokudrive-core
//!
//! Client library for driving the on-device test component of a Roku channel.
//!
//! The component listens on TCP (port 9000 by default) and answers JSON
//! requests carried in a small binary frame. This crate owns the socket,
//! matches responses to requests by id, enforces per-request timeouts, and
//! rebuilds the device's scene graph from its flat node listing.
//!
//! ## Modules
//!
//! - [`client`] - [`DeviceClient`](client::DeviceClient), the typed entry point
//! - [`protocol`] - Frame codec and request/response envelopes
//! - [`request`] - Request kinds and their result shapes
//! - [`connection`] - Lazy connect, refusal retry and the socket reader task
//! - [`node_tree`] - Scene graph reconstruction from `storeNodeReferences`
//! - [`registry`] - Session snapshot of the device registry
//! - [`config`] - Device configuration (`~/.rokudrive/config.json`)
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use rokudrive_core::client::{DeviceClient, RequestOptions};
//! use rokudrive_core::config::DeviceConfig;
//! use rokudrive_core::request::BaseType;
//!
//! # async fn example() -> Result<(), rokudrive_core::error::RpcError> {
//! let client = DeviceClient::new(DeviceConfig::new("192.168.1.20"))?;
//!
//! let focused = client.get_focused_node(true).await?;
//! println!("focused ref: {:?}", focused.node_ref);
//!
//! let changed = client
//!     .on_field_change_once(
//!         BaseType::Scene,
//!         "loading.visible",
//!         None,
//!         &RequestOptions::new().with_timeout(Duration::from_secs(30)).located(),
//!     )
//!     .await?;
//! println!("loading.visible is now {changed}");
//!
//! client.shutdown().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod node_tree;
mod pending;
pub mod protocol;
pub mod registry;
pub mod request;
