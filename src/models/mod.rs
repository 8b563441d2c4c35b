pub mod ai;
pub mod audit;
pub mod automation;
pub mod event;
pub mod scheduled_action;
pub mod sla;
pub mod thread;
pub mod usage;

pub use ai::*;
pub use audit::*;
pub use automation::*;
pub use event::*;
pub use scheduled_action::*;
pub use sla::*;
pub use thread::*;
pub use usage::*;
