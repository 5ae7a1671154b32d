pub mod push_domain_service;
pub mod session_domain_service;

pub use push_domain_service::PushDomainService;
pub use session_domain_service::{LoginOutcome, SessionDomainService};
