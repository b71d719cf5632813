//! The periodic prober: ring-buffer history, incremental statistics and
//! the three cooperating loops that drive a target.

mod result;
pub use result::*;

mod history;
pub use history::*;

mod stats;
pub use stats::*;

mod pinger;
pub use pinger::*;
