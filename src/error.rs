use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("bridge '{0}' already exists")]
    DuplicateId(String),

    #[error("port {port} is already used by bridge '{owner}'")]
    PortInUse { port: u16, owner: String },

    #[error("invalid bridge name: {0:?}")]
    InvalidName(String),

    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("bridge '{0}' not found")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Short machine-readable slug, used when errors cross the control-plane socket.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::DuplicateId(_) => "duplicate-id",
            Self::PortInUse { .. } => "port-in-use",
            Self::InvalidName(_) => "invalid-name",
            Self::InvalidRange { .. } => "invalid-range",
            Self::NotFound(_) => "not-found",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Archive(_) => "archive",
            Self::Other(_) => "other",
        }
    }

    /// Contract violations are the caller's fault; everything else is environmental.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId(_)
                | Self::PortInUse { .. }
                | Self::InvalidName(_)
                | Self::InvalidRange { .. }
                | Self::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
