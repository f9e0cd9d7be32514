//! Pluggable authentication control for inbound connections

use async_trait::async_trait;

/// Authentication methods a controller can admit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// The `none` method.
    None,
    /// Password authentication.
    Password,
    /// Public key authentication.
    PublicKey,
}

/// Decides authentication and channel admission for inbound clients.
///
/// One controller instance serves every connection of a listener, so
/// implementations hold shared state behind interior mutability if they
/// need any.
#[async_trait]
pub trait AuthController: Send + Sync {
    /// Methods to advertise to the given user. The listener also calls this
    /// with an empty username when assembling the transport configuration.
    fn allowed_auth_methods(&self, username: &str) -> Vec<AuthMethod>;

    /// Whether a `none` authentication attempt succeeds.
    async fn check_auth_none(&self, _username: &str) -> bool {
        false
    }

    /// Whether the username/password pair is valid.
    async fn check_auth_password(&self, _username: &str, _password: &str) -> bool {
        false
    }

    /// Whether the offered public key authenticates the user.
    async fn check_auth_publickey(&self, _username: &str, _key: &russh::keys::PublicKey) -> bool {
        false
    }

    /// Whether a channel open request of `kind` is granted.
    fn check_channel_open_request(&self, kind: &str) -> bool {
        kind == "session"
    }

    /// Whether the named subsystem may be started on a granted channel.
    fn check_subsystem_request(&self, _name: &str) -> bool {
        false
    }

    /// Whether an exec request for `command` may be started on a granted
    /// channel.
    fn check_exec_request(&self, _command: &str) -> bool {
        false
    }
}

/// Fixed username/password controller admitting session channels and one
/// configured subsystem.
pub struct UserPassController {
    username: String,
    password: String,
    subsystem: Option<String>,
    allow_exec: bool,
}

impl UserPassController {
    /// Controller accepting exactly this username/password pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            subsystem: None,
            allow_exec: false,
        }
    }

    /// Admit the named subsystem on granted channels.
    pub fn with_subsystem(mut self, name: impl Into<String>) -> Self {
        self.subsystem = Some(name.into());
        self
    }

    /// Admit exec requests on granted channels.
    pub fn allow_exec(mut self) -> Self {
        self.allow_exec = true;
        self
    }
}

#[async_trait]
impl AuthController for UserPassController {
    fn allowed_auth_methods(&self, _username: &str) -> Vec<AuthMethod> {
        vec![AuthMethod::Password]
    }

    async fn check_auth_password(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }

    fn check_subsystem_request(&self, name: &str) -> bool {
        self.subsystem.as_deref() == Some(name)
    }

    fn check_exec_request(&self, _command: &str) -> bool {
        self.allow_exec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_password_check() {
        let controller = UserPassController::new("admin", "secret");
        assert!(controller.check_auth_password("admin", "secret").await);
        assert!(!controller.check_auth_password("admin", "wrong").await);
        assert!(!controller.check_auth_password("other", "secret").await);
        assert!(!controller.check_auth_none("admin").await);
    }

    #[tokio::test]
    async fn test_channel_and_subsystem_admission() {
        let controller = UserPassController::new("admin", "secret").with_subsystem("netconf");
        assert!(controller.check_channel_open_request("session"));
        assert!(!controller.check_channel_open_request("direct-tcpip"));
        assert!(controller.check_subsystem_request("netconf"));
        assert!(!controller.check_subsystem_request("sftp"));
    }

    #[test]
    fn test_exec_admission_is_opt_in() {
        let plain = UserPassController::new("a", "b");
        assert!(!plain.check_exec_request("ls"));
        let with_exec = UserPassController::new("a", "b").allow_exec();
        assert!(with_exec.check_exec_request("ls"));
    }

    #[test]
    fn test_advertised_methods() {
        let controller = UserPassController::new("a", "b");
        assert_eq!(
            controller.allowed_auth_methods("a"),
            vec![AuthMethod::Password]
        );
    }
}
