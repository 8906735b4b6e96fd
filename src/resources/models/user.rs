//! User resource.

use serde::{Deserialize, Serialize};

/// Account state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Registered,
    Locked,
    Invited,
}

/// A user as returned by the backing data service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub login: String,
    pub firstname: String,
    pub lastname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail: Option<String>,
    #[serde(default)]
    pub status: UserStatus,
}

impl User {
    pub fn new(
        id: u64,
        login: impl Into<String>,
        firstname: impl Into<String>,
        lastname: impl Into<String>,
    ) -> Self {
        Self {
            id,
            login: login.into(),
            firstname: firstname.into(),
            lastname: lastname.into(),
            mail: None,
            status: UserStatus::Active,
        }
    }

    /// Full name for display, falling back to the login.
    pub fn name(&self) -> String {
        let name = format!("{} {}", self.firstname, self.lastname);
        let name = name.trim();
        if name.is_empty() {
            self.login.clone()
        } else {
            name.to_string()
        }
    }

    pub fn is_locked(&self) -> bool {
        self.status == UserStatus::Locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_falls_back_to_login() {
        assert_eq!(User::new(1, "jdoe", "John", "Doe").name(), "John Doe");
        assert_eq!(User::new(2, "bot", "", "").name(), "bot");
    }
}
