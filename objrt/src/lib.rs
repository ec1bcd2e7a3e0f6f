mod arena;
mod collector;
pub mod global;
mod header;
mod interface_map;
mod packing;
mod roots;
mod runtime;
mod settings;
mod system;
mod types;

pub use arena::*;
pub use collector::{CycleSummary, Collector, GcPhase, GcStats, RootSet, Tracer};
pub use header::*;
pub use interface_map::*;
pub use packing::*;
pub use roots::*;
pub use runtime::*;
pub use settings::*;
pub use system::{OS_PAGE_SIZE, map_memory, page_align, unmap_memory};
pub use types::*;
