//! Token authorisation: fingerprinting, the result cache and the validator
//! that combines them with an identity provider.

pub mod cache;
pub mod fingerprint;
pub mod outcome;
pub mod validator;
