//! `codedefender-core`: the obfuscation transformation engine. Drives criticality analysis,
//! size-budget planning, and the per-function/module-scoped transformation passes (C1-C17) over
//! a `codedefender-ir::Module`, re-verifying after each pass (spec §3-§4).

pub mod antidebug;
pub mod bogus;
pub mod budget;
pub mod calls;
pub mod constants;
pub mod control_flow;
pub mod criticality;
pub mod crypto;
pub mod flatten;
pub mod integrity;
pub mod model;
pub mod opaque;
pub mod orchestrator;
pub mod polymorphic;
pub mod report;
pub mod rng;
pub mod strings;
pub mod substitute;
pub mod verify;

pub use budget::EffectiveConfig;
pub use model::{
    ApiResolutionCacheSlot, Counters, EncryptedStringRecord, FunctionAnalysisRecord,
    FunctionPointerTable, OriginalFunctionSet,
};
pub use orchestrator::run;
pub use rng::Prng;
