//! Resumable, verifiable dataset downloads and derived-file actions.

pub mod action;
pub mod auth;
pub mod batch;
pub mod config;
pub mod digest;
pub mod domain;
pub mod download;
pub mod error;
pub mod output;
pub mod partial;
pub mod policy;
pub mod producers;
pub mod remote;
pub mod status;
pub mod store;
