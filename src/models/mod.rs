pub mod billing;
pub mod endpoint;
pub mod token;

pub use billing::BillingRate;
pub use endpoint::Endpoint;
pub use token::Token;
