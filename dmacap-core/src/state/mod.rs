pub mod negotiation;
pub mod session;

pub use negotiation::NegotiationPhase;
pub use session::{Failure, FailureKind, SessionPhase};
