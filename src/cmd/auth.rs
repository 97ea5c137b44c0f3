//! Commands issued by the connection handshake.

use crate::cmd::Command;

/// Authenticate the connection.
///
/// With a username this is the ACL form `AUTH username password`.
pub struct Auth {
    username: Option<String>,
    password: String,
}

impl Auth {
    pub fn new(username: Option<String>, password: impl ToString) -> Auth {
        Auth {
            username,
            password: password.to_string(),
        }
    }

    pub fn into_command(self) -> Command {
        let cmd = Command::new("AUTH");
        match self.username {
            Some(user) => cmd.arg(user).arg(self.password),
            None => cmd.arg(self.password),
        }
    }
}

// Debug 不打印密码
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Switch the connection to database `index`.
#[derive(Debug)]
pub struct Select {
    index: u32,
}

impl Select {
    pub fn new(index: u32) -> Select {
        Select { index }
    }

    pub fn into_command(self) -> Command {
        Command::new("SELECT").int(self.index as i64)
    }
}

/// Name the connection so it shows up in `CLIENT LIST`.
#[derive(Debug)]
pub struct ClientSetName {
    name: String,
}

impl ClientSetName {
    pub fn new(name: impl ToString) -> ClientSetName {
        ClientSetName {
            name: name.to_string(),
        }
    }

    pub fn into_command(self) -> Command {
        Command::new("CLIENT").arg("SETNAME").arg(self.name)
    }
}
