use thiserror::Error;

#[derive(Error, Debug)]
pub enum HalogenError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Module '{module}' failed to start: {message}")]
    StartupFault { module: String, message: String },

    #[error("Module '{module}' could not handle an event! Event = {event}. Encountered Error = {message}")]
    ModuleFault {
        module: String,
        event: String,
        message: String,
    },
}

impl HalogenError {
    /// Reason logged when this fault shuts the core down.
    pub fn shutdown_reason(&self) -> String {
        match self {
            Self::ModuleFault { module, .. } => format!("Module '{module}' failed to handle event."),
            _ => "critical".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HalogenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_reason_names_faulty_module() {
        let fault = HalogenError::ModuleFault {
            module: "alpha".to_string(),
            event: "ping".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(fault.shutdown_reason(), "Module 'alpha' failed to handle event.");

        let startup = HalogenError::StartupFault {
            module: "alpha".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(startup.shutdown_reason(), "critical");
    }
}
