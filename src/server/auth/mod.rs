pub mod challenge;
pub mod credentials;
pub mod token_provider;
pub mod token_storage;

pub use challenge::AuthChallenge;
pub use credentials::Credentials;
pub use token_provider::{Token, TokenProvider};
pub use token_storage::TokenCache;
