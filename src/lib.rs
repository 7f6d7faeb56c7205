#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod domain;
pub mod error;
pub mod host;
pub mod hypervisor;
pub mod image;
pub mod logging;
pub mod overlay;
pub mod paths;
pub mod provision;
pub mod shutdown;
pub mod util;
