#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fetcher;
pub mod handlers;
pub mod image_host;
pub mod instances;
pub mod logging;
pub mod names;
pub mod paths;
pub mod progress;
pub mod simplestreams;
pub mod ssh;
pub mod util;
pub mod vault;

#[cfg(test)]
mod testing;
