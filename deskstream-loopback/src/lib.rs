//! # deskstream-loopback: in-process streaming session
//!
//! Runs a host pipeline (synthetic capture → software encode) and a
//! client pipeline (decode → headless render) in one process, joined by
//! a simulated link that carries every message in its wire encoding.
//!
//! The session is the pipelines' owner: it forwards keyframe requests,
//! rebuilds the client when its decoder dies, renegotiates when the
//! host display mode changes and feeds link telemetry to the client.

pub mod config;
pub mod link;
pub mod service;
