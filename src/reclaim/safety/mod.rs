mod context;
mod gate;
mod validation;

pub use gate::{ApprovedAction, GateReview, RejectedAction, RejectionReason, SafetyGate};
pub use validation::{OwnershipCheck, SignatureCheck};

#[cfg(test)]
pub(crate) use gate::approve_unchecked;
