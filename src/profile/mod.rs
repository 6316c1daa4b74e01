//! Self-declared profile writes.
//!
//! Both services implement the staged write-behind state machine: read the
//! current document (cache, then store), apply the patch with a version
//! bump, stage the result in the cache (read-your-writes), enqueue the
//! store mutation, and roll the cache back if the enqueue fails. In-process
//! writes to the same CPF are serialized with a keyed lock; cross-process
//! ordering is settled by the store-side version check.

pub mod overlay;
pub mod userconfig;

pub use overlay::OverlayService;
pub use userconfig::UserConfigService;
