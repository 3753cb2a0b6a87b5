//! Native management library abstraction
//!
//! The policy pipeline talks to the vendor library only through
//! [`PolicyBackend`], so the production binding and the test mock are
//! interchangeable.

mod interface;
mod mock;

pub use interface::*;
pub use mock::MockBackend;
