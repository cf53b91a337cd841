pub mod event;
pub mod process;

pub use event::ProcessEvent;
pub use process::{ParentPid, ProcessNode, TreeSnapshot};
