//! # libresizer: volume expansion and modification controllers
//!
//! `libresizer` reconciles storage claims against their bound volumes.  It
//! grows volumes when a claim asks for more capacity and re-applies volume
//! attribute classes when a claim asks for a different one, calling the
//! storage driver for the control-plane part of each operation.  It follows
//! the RK8s conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: claims, volumes, attribute classes, pods, statuses. |
//! | [`error`] | [`Error`] enum and the [`DriverError`] taxonomy. |
//! | [`config`] | [`ControllerConfig`]: workers, retry intervals, feature switches. |
//! | [`conditions`] | Merge-by-type helpers for claim conditions. |
//! | [`events`] | [`EventRecorder`] seam for user-visible events. |
//! | [`store`] | [`ResourceStore`] trait and the in-memory store. |
//! | [`driver`] | [`DriverClient`] trait: the storage driver's control plane. |
//! | [`resizer`] | [`Resizer`] implementations and startup selection. |
//! | [`modifier`] | [`Modifier`] wrapper around the driver modify call. |
//! | [`slowset`] | [`SlowSet`], a time-windowed backoff set. |
//! | [`inuse`] | [`InUseTracker`]: which claims live pods mount. |
//! | [`workqueue`] | Deduplicating, rate-limited key queue. |
//! | [`controller`] | Reconciler loop plus the resize and modify controllers. |
//!
//! ## Running
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use libresizer::{ControllerConfig, DriverClient, LogRecorder, ResourceStore};
//! # async fn start(driver: Arc<dyn DriverClient>, store: Arc<dyn ResourceStore>) -> Result<(), libresizer::Error> {
//! let config = ControllerConfig::default().with_env_overrides()?;
//! let (tx, rx) = tokio::sync::watch::channel(false);
//! let (resize, _driver_name) = libresizer::new_resize_controller(
//!     driver,
//!     store,
//!     Arc::new(LogRecorder),
//!     config.clone(),
//! )
//! .await?;
//! let handle = tokio::spawn(resize.run(config.resize_workers, rx));
//! // ...
//! tx.send_replace(true);
//! let _ = handle.await;
//! # Ok(())
//! # }
//! ```

pub mod conditions;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod events;
pub mod inuse;
pub mod modifier;
pub mod resizer;
pub mod slowset;
pub mod store;
pub mod types;
pub mod workqueue;

pub use config::ControllerConfig;
pub use controller::{
    ModifyController, ResizeController, new_modify_controller, new_resize_controller,
};
pub use driver::{DriverClient, ExpandResponse};
pub use error::{DriverCode, DriverError, Error};
pub use events::{EventRecorder, EventType, LogRecorder};
pub use inuse::InUseTracker;
pub use modifier::Modifier;
pub use resizer::Resizer;
pub use slowset::SlowSet;
pub use store::{ResourceStore, StoreEvent};
pub use types::*;
