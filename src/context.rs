//! Explicit caller context

use serde::{Deserialize, Serialize};

/// Who is acting. Passed to every vault operation; there is no ambient
/// session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    /// Owner the operation acts for
    pub owner_id: String,
}

impl Context {
    /// Context acting for `owner_id`
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }
}
