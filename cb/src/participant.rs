//! Participant identities
//!
//! The set of actors on the bus is fixed: three specialized workers plus the
//! coordinator. `Recipient` adds the `broadcast` routing pseudo-target, which is
//! never a real identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name reserved for the broadcast pseudo-target
pub const BROADCAST: &str = "broadcast";

/// Error returned when parsing an unknown participant or recipient name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown participant: {0}")]
pub struct UnknownParticipant(pub String);

/// One of the fixed named actors able to send and receive messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Participant {
    /// Writes test code for the page under test
    TestAuthor,
    /// Produces documentation for generated artifacts
    Documenter,
    /// Analyzes pages, failures and code changes
    Analyst,
    /// Owns the bus and the store and dispatches work
    Coordinator,
}

impl Participant {
    /// Every participant, in the fixed order used for broadcast fan-out
    pub const ALL: [Participant; 4] = [
        Participant::TestAuthor,
        Participant::Documenter,
        Participant::Analyst,
        Participant::Coordinator,
    ];

    /// The wire name of this participant
    pub fn as_str(&self) -> &'static str {
        match self {
            Participant::TestAuthor => "test-author",
            Participant::Documenter => "documenter",
            Participant::Analyst => "analyst",
            Participant::Coordinator => "coordinator",
        }
    }

    /// True for the three worker roles
    pub fn is_worker(&self) -> bool {
        !matches!(self, Participant::Coordinator)
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Participant {
    type Err = UnknownParticipant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Participant::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownParticipant(s.to_string()))
    }
}

/// Routing target of a message: a single participant or everyone but the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    Participant(Participant),
    Broadcast,
}

impl Recipient {
    /// The participant this recipient names, if it is not a broadcast
    pub fn participant(&self) -> Option<Participant> {
        match self {
            Recipient::Participant(p) => Some(*p),
            Recipient::Broadcast => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recipient::Participant(p) => p.as_str(),
            Recipient::Broadcast => BROADCAST,
        }
    }
}

impl From<Participant> for Recipient {
    fn from(participant: Participant) -> Self {
        Recipient::Participant(participant)
    }
}

impl PartialEq<Participant> for Recipient {
    fn eq(&self, other: &Participant) -> bool {
        matches!(self, Recipient::Participant(p) if p == other)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recipient {
    type Err = UnknownParticipant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == BROADCAST {
            return Ok(Recipient::Broadcast);
        }
        s.parse().map(Recipient::Participant)
    }
}

impl TryFrom<String> for Recipient {
    type Error = UnknownParticipant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Recipient> for String {
    fn from(recipient: Recipient) -> Self {
        recipient.as_str().to_string()
    }
}
