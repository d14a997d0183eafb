//! amrlink Twinzo - REST client for the Twinzo digital-twin platform
//!
//! Implements the two HTTP seams of `amrlink-core`:
//! - [`IdentityProvider`](amrlink_core::IdentityProvider) via `POST /v3/authorization/authenticate`
//! - [`LocalizationSink`](amrlink_core::LocalizationSink) via `POST /v3/localization`

pub mod api;
pub mod client;

pub use api::{AuthRequest, AuthResponse};
pub use client::{TwinzoClient, TwinzoConfig, TwinzoError, DEFAULT_BASE_URL};
