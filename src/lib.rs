// SPDX-License-Identifier: MIT OR Apache-2.0

//! mfdlib implements the mass-storage directory of a 36-bit exec: disk pack
//! labels and geometry, the packed word-to-byte block codec, the master file
//! directory with its lead/main/DAD structures, and the catalog, assign, and
//! allocation services built on top, all over file-backed pack images.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod consts;
pub mod dad;
pub mod device;
pub mod exec;
pub mod facstatus;
pub mod fas;
pub mod freespace;
pub mod fspec;
pub mod mfd;
pub mod pack;
pub mod types;
pub mod word;

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod tests;
