#![cfg_attr(not(test), no_std)]

#[cfg(test)]
extern crate std;

// Layered driver for an Iridium Short Burst Data terminal with a cabin
// interface board on the same UART.
//
// This crate stays portable across MCU firmware and host tooling by avoiding
// the Rust standard library and keeping every hardware, filesystem, and
// clock dependency behind the seams in `platform`.

pub mod at;
pub mod log;
pub mod platform;
pub mod serial;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;
