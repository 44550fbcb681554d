pub mod config_apply;
pub mod flags;
pub mod gagefile;
pub mod lifecycle;
pub mod phases;
pub mod sourcecode;
pub mod supervisor;

pub use flags::parse_flag_assigns;
pub use gagefile::{Gagefile, OpDef};
pub use lifecycle::{
    finalize, preview, run, stage, start, Preview, RunContext, RunOptions, RunOutcome,
    EXIT_SKIPPED,
};
pub use phases::{PhaseBus, PhaseEvent};
pub use supervisor::CancelToken;
