use std::{collections::HashMap, net::SocketAddr};

use log::{debug, warn};
use thiserror::Error;

use super::Authenticator;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{user}: Authentication failed: password is incorrect, or there is no user with such name")]
    InvalidCredentials { user: String },
}

/// Users from a fixed list of `name → password`.
#[derive(Debug, Clone)]
pub struct StaticUsers {
    users: HashMap<String, String>,
}

impl StaticUsers {
    /// An empty list allows only user `default` with an empty password.
    pub fn new(users: &[(String, String)]) -> Self {
        let mut users: HashMap<String, String> = users.iter().cloned().collect();
        if users.is_empty() {
            users.insert("default".to_string(), String::new());
        }
        Self { users }
    }
}

impl Authenticator for StaticUsers {
    fn authenticate(&self, user: &str, password: &str, peer: SocketAddr) -> Result<(), AuthError> {
        match self.users.get(user) {
            Some(expected) if expected == password => {
                debug!("authenticated {user} from {peer}");
                Ok(())
            }
            _ => {
                warn!("authentication failed for {user} from {peer}");
                Err(AuthError::InvalidCredentials {
                    user: user.to_string(),
                })
            }
        }
    }

    fn user_exists(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }
}
