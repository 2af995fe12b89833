//! Delivery of encoded objects to the archive.

mod client;
mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

pub use client::AssociationClient;
pub use orchestrator::{
	BatchReport, ObjectStatus, Phase, Progress, TransferOrchestrator, TransferSettings,
};

use crate::dimse::association::AssociationError;
use crate::types::US;
use serde::Serialize;
use std::fmt::{Display, Formatter};

/// The result of a single store transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TransferOutcome {
	/// The archive answered with status `0x0000`.
	Delivered,
	/// The archive answered with the contained non-success status.
	Rejected(US),
	/// No usable answer was received.
	Failed(String),
}

impl TransferOutcome {
	pub(crate) fn not_established(error: &AssociationError) -> Self {
		Self::Failed(format!("association not established ({error})"))
	}

	pub(crate) fn cancelled() -> Self {
		Self::Failed(String::from("cancelled"))
	}
}

impl Display for TransferOutcome {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Delivered => write!(f, "delivered"),
			Self::Rejected(status) => write!(f, "rejected with status {status:#06X}"),
			Self::Failed(detail) => write!(f, "failed: {detail}"),
		}
	}
}
