// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

pub mod node;
pub use node::*;
pub mod config;
pub use config::*;
pub mod error;
pub use error::{Error, Result};
pub mod types;
pub use types::*;

pub mod assignment;
pub mod attestor;
pub mod chain;
pub mod chunk_store;
pub mod expiry;
pub mod merkle;
pub mod retrieval;
pub mod validator;
pub mod verifier;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
