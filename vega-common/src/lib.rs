//! # vega-common
//!
//! Shared primitive types for the Vega kernel crates.
//!
//! This crate defines the handful of types that every other Vega crate
//! agrees on: address newtypes used in syscall arguments, kernel objects
//! and thread register contexts.
//!
//! # no_std
//!
//! This crate is `#![no_std]` and has zero dependencies, making it suitable
//! as a foundation crate that all other Vega crates can depend on.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;

// Re-export commonly used types
pub use addr::VirtAddr;
