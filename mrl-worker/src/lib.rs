//! Task-side machinery: input splitting, the map and reduce task bodies,
//! the shuffle between them and the partition output writer.
//!
//! Nothing in here schedules anything. The coordinator decides which
//! attempt runs where and which results are kept.

pub mod map;
pub mod output;
pub mod reduce;
pub mod shuffle;
pub mod split;
pub mod task;

pub use map::{read_split, run_map, LineRecords, SplitContents};
pub use output::OutputWriter;
pub use reduce::{run_reduce, ReduceStats};
pub use shuffle::ShuffleEngine;
pub use split::{split, Split};
pub use task::TaskContext;
