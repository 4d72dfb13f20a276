//! Transaction construction, signing and submission for the custody account

pub mod builder;
pub mod codec;
mod fee;
mod sender;
pub mod signer;

pub use builder::FinishRates;
pub use codec::{Transaction, TransactionType};
pub use fee::FeeSchedule;
pub use sender::{Submission, TransactionSender};
pub use signer::CustodySigner;
