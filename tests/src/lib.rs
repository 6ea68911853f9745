//! Host-based integration tests.
//!
//! Everything here runs the real master and slave engines against each
//! other through the loopback bus, with a shared dispatcher and a manually
//! stepped timer. No hardware, no threads.

#[cfg(test)]
mod link_tests;
#[cfg(test)]
mod system_tests;
