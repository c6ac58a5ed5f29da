//! Spoken command layer: text normalization, phrase registry with alias
//! variations, and the engine that executes matched actions.

pub mod engine;
pub mod normalize;
pub mod registry;

pub use engine::{CommandEngine, CommandOutcome};
pub use registry::{CommandAction, CommandEntry, CommandMatch, CommandRegistry, MatchTier};
