use rand::{distributions::Alphanumeric, Rng};
use rsip::headers::UntypedHeader;

pub mod key;
pub mod registry;
pub mod timer;
pub mod transaction;
pub use key::TransactionKey;
pub use registry::Transactions;
pub use transaction::{Transaction, T1, TRANSACTION_TTL};
#[cfg(test)]
mod tests;

pub const BRANCH_PREFIX: &str = "z9hG4bK";
const BRANCH_LEN: usize = 12;
const TAG_LEN: usize = 8;
const CALL_ID_LEN: usize = 22;

pub fn random_text(count: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(rsip::param::Branch::new(format!(
        "{}{}",
        BRANCH_PREFIX,
        random_text(BRANCH_LEN)
    )))
}

pub fn make_tag() -> rsip::param::Tag {
    rsip::param::Tag::new(random_text(TAG_LEN))
}

pub fn make_call_id() -> rsip::headers::CallId {
    rsip::headers::CallId::new(random_text(CALL_ID_LEN))
}
