//! Account Store and Account Selector (spec §4.3, §4.4), plus the History Store
//! the Upload Worker appends to on every attempt (spec §4.6 step 6/7).

pub mod history;
pub mod selector;
pub mod store;

pub use history::{HistoryError, HistoryStore, PostgresHistoryStore};
pub use selector::{AccountSelector, SelectorError};
pub use store::{AccountStore, PostgresAccountStore, StoreError};
