// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Which of the two chained wire protocols raised a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Sahara,
    Firehose,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Sahara => write!(f, "sahara"),
            Protocol::Firehose => write!(f, "firehose"),
        }
    }
}

#[derive(Debug, Error)]
pub enum QdlError {
    #[error("couldn't reach the device: {0}")]
    Connection(String),

    #[error("USB transfer failed: {0}")]
    Usb(#[source] io::Error),

    #[error("{protocol} protocol violation: {reason}")]
    Protocol { protocol: Protocol, reason: String },

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("flashing '{partition}' failed: {reason}")]
    Flash { partition: String, reason: String },

    #[error("GPT on LUN {lun}: {reason}")]
    Gpt { lun: u8, reason: String },

    #[error("bad sparse image: {0}")]
    Sparse(String),

    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },
}

impl QdlError {
    pub(crate) fn sahara(reason: impl Into<String>) -> Self {
        QdlError::Protocol {
            protocol: Protocol::Sahara,
            reason: reason.into(),
        }
    }

    pub(crate) fn firehose(reason: impl Into<String>) -> Self {
        QdlError::Protocol {
            protocol: Protocol::Firehose,
            reason: reason.into(),
        }
    }

    pub(crate) fn gpt(lun: u8, reason: impl Into<String>) -> Self {
        QdlError::Gpt {
            lun,
            reason: reason.into(),
        }
    }

    pub(crate) fn flash(partition: impl Into<String>, reason: impl Into<String>) -> Self {
        QdlError::Flash {
            partition: partition.into(),
            reason: reason.into(),
        }
    }

    /// Classify a transport error against the budget that was in effect.
    pub(crate) fn from_io(e: io::Error, budget: Duration) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => QdlError::Timeout(budget.as_millis() as u64),
            _ => QdlError::Usb(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, QdlError>;
