#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! ## Feature flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod bus;
pub mod crc;
pub mod dispatch;
pub mod gates;
pub mod machine;
pub mod pid;
pub mod relay;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod transport;
pub mod version;
pub mod wire;
