// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for loss recovery operations.

use strum_macros::EnumIter;

use crate::metrics::Counter;

/// Loss recovery engine error.
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// There is no more work to do.
    #[default]
    Done,

    /// The scoreboard no longer tiles `[snd_una, snd_max)`. The engine state
    /// of the connection cannot be trusted anymore and is aborted.
    StructuralViolation(String),

    /// The target of a scheduled action vanished, usually because a racing
    /// ack covered it first.
    StaleAction,

    /// An ack carried a SACK block outside `[snd_una, snd_max)` or blocks
    /// that are not well formed.
    MalformedInput(String),

    /// A bounded counter reached its maximum and was frozen.
    CounterSaturation,

    /// An RTT sample was negative, zero or implausibly large.
    TimingAnomaly,

    /// The scoreboard reached its record limit, the mutation was refused
    /// without touching the records.
    ResourceExhausted,

    /// The engine was aborted by an earlier structural violation.
    EngineAborted,

    /// The configuration is invalid.
    InvalidConfig(String),

    /// The transmit primitive failed.
    TransmitFailed(String),
}

impl Error {
    /// Return the observability counter bumped for the error.
    pub fn counter(&self) -> Option<Counter> {
        match self {
            Error::StructuralViolation(_) => Some(Counter::StructuralViolations),
            Error::StaleAction => Some(Counter::StaleActions),
            Error::MalformedInput(_) => Some(Counter::MalformedSackBlocks),
            Error::CounterSaturation => Some(Counter::CounterSaturations),
            Error::TimingAnomaly => Some(Counter::TimingAnomalies),
            Error::ResourceExhausted => Some(Counter::SplitsRefused),
            Error::TransmitFailed(_) => Some(Counter::TransmitFailures),
            Error::Done | Error::EngineAborted | Error::InvalidConfig(_) => None,
        }
    }

    /// Whether the error leaves the engine unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StructuralViolation(_) | Error::EngineAborted)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
