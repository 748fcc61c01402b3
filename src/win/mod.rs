//! Win32 plumbing: raw volume/journal I/O, the trust and crypto services,
//! session lookup, privileges, and the system decompression service.

pub mod compress;
pub mod privilege;
pub mod session;
pub mod trust;
pub mod volume;
