//! HTTP handlers, grouped by surface: upload lifecycle, admin maintenance,
//! and operational probes.

pub mod admin_handlers;
pub mod health_handlers;
pub mod upload_handlers;
