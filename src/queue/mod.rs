pub mod events;
pub mod lanes;
pub mod run;

pub use events::{EventHub, QueueEvent};
pub use lanes::{QueueFull, RunQueue};
pub use run::{Priority, Run, RunPayload, RunState, Verdict};
