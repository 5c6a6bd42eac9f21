//! Optional push-messaging integration.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessagingMode {
    Test,
    #[default]
    Production,
}

impl MessagingMode {
    pub fn test_mode_flag(self) -> &'static str {
        match self {
            Self::Test => "2",
            Self::Production => "0",
        }
    }
}

/// Collaborator that owns the platform push registration. It is handed the
/// collector settings once at build time and reports tokens back through
/// [`crate::Pulse::on_registration_id`].
pub trait MessagingCapability: Send + Sync {
    fn store_configuration(&self, server_url: &str, app_key: &str, device_id: Option<&str>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        assert_eq!(MessagingMode::Test.test_mode_flag(), "2");
        assert_eq!(MessagingMode::Production.test_mode_flag(), "0");
        assert_eq!(MessagingMode::default(), MessagingMode::Production);
    }
}
