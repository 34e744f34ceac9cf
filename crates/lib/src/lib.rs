//! # A/B slot system updater
//!
//! This crate implements a redundant-slot (A/B) updater: it verifies a
//! signed update bundle or a signed network manifest, writes each payload
//! into the matching inactive slot, and promotes the freshly written
//! slots through a pluggable bootloader backend so they become active on
//! the next boot.

pub mod bootloader;
pub mod bootname;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod install;
pub mod manifest;
pub mod signature;
pub mod slot;
pub mod status;

pub(crate) mod keyfile;
