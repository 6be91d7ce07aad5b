mod manager;

pub use manager::{
    CreateSolicitationRequest, Solicitation, SolicitationError, SolicitationKind,
    SolicitationManager, SolicitationStatus, Urgency,
};
