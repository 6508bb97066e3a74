pub mod access_token;
pub mod callback;
pub mod transaction;
