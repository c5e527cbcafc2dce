//! K-lines: user@host bans, permanent for the life of the process.

use crate::state::user::User;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KLine {
    /// Glob mask over the user half of user@host.
    pub user_mask: String,
    /// Glob mask over the host half.
    pub host_mask: String,
    pub reason: String,
}

impl KLine {
    pub fn matches(&self, user: &User) -> bool {
        user.matches_mask(&self.user_mask, &self.host_mask)
    }
}
