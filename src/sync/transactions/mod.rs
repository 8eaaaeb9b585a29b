//! Transaction synchronization under a bloom filter.
//!
//! [`TransactionsReader`] owns the transaction subscription and widens its filter whenever the
//! wallet derives new addresses. [`TransactionsSyncWorker`] verifies what the reader surfaces
//! against the local header index and imports it into storage.

mod reader;
mod worker;

pub use reader::{
	AddressAppender, MerkleBlockVerdict, ReaderEvent, TransactionsReader, TransactionsReaderOptions,
};
pub use worker::{TransactionsSyncState, TransactionsSyncWorker};
