use std::{fmt, str::FromStr};

use clap::ValueEnum;
use thiserror::Error;

/// Role is fixed when an interceptor is built and never changes afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum Role {
    /// Sends probes and receives the acks coming back.
    Initiator,
    /// Receives probes and answers each with an ack.
    #[default]
    Responder,
}

/// RolesError is an enum that represents the error that can occur when parsing a role.
#[derive(Error, Debug)]
pub enum RolesError {
    #[error("Invalid role")]
    InvalidRole,
}

impl FromStr for Role {
    type Err = RolesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiator" => Ok(Role::Initiator),
            "responder" => Ok(Role::Responder),
            _ => Err(RolesError::InvalidRole),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}
