//! The CLI's top-level error type. Wraps every failure domain the session
//! stack can surface and picks a process exit code for each (spec §7).

use drift_session::SessionError;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("kubernetes client setup failed: {0}")]
    Kube(String),

    #[error(transparent)]
    Config(#[from] drift_config::ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("no named intercept \"{0}\" is active")]
    NoSuchIntercept(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Kube(_) => 2,
            Self::Config(_) => 2,
            Self::NoSuchIntercept(_) => 3,
            Self::Session(error) => match error {
                SessionError::AlreadyExists(_)
                | SessionError::LocalTargetInUse(_)
                | SessionError::MountPointBusy(_) => 3,
                SessionError::Timeout(_) => 4,
                SessionError::NotFound(_) => 5,
                _ => 1,
            },
        }
    }
}
