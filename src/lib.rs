//! # node-crypt
//!
//! Boot-time disk encryption for cluster nodes. Every matching block device
//! is either already enrolled, in which case its key is fetched from the
//! custody service, or it is enrolled now: a device id is written to its
//! header, the device is formatted under a fresh key and the key is
//! registered with custody. Devices are unlocked only once all of them have
//! a durable key.
//!
//! ```bash
//! node-crypt --custody-url https://custody.internal:8443 run 'nvme-*'
//! ```

pub mod cli;
pub mod config;
pub mod crypt;
pub mod custody;
pub mod device;
pub mod enroll;
pub mod modules;
