pub mod transaction;
pub mod utils;

pub use transaction::{sample_transaction, Transaction, TransactionRequest};
pub use utils::{AddressType, SizeCategory};
