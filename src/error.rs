use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("A handler is already registered for topic {topic}"))]
    AlreadyRegistered { topic: String },

    #[snafu(display("No handler is registered for topic {topic}"))]
    NotRegistered { topic: String },

    #[snafu(display("Invalid topic: {message}"))]
    InvalidTopic { message: String },

    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },

    /// A guarded store batch was rejected because the message is no longer
    /// where the caller expected it to be.
    #[snafu(display("Conflict: {message}"))]
    Conflict { message: String },

    #[snafu(display("Queue service is closed"))]
    Closed,

    #[snafu(display("Error returned from backing store: {source}"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Error encoding or decoding message: {source}"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn message_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }

    pub fn invalid_topic(message: impl Into<String>) -> Self {
        Self::InvalidTopic {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::NotFound { .. } | Self::NotRegistered { .. } => {
                actix_web::http::StatusCode::NOT_FOUND
            }

            Self::InvalidTopic { .. } | Self::InvalidConfig { .. } => {
                actix_web::http::StatusCode::BAD_REQUEST
            }

            Self::AlreadyRegistered { .. } | Self::Conflict { .. } => {
                actix_web::http::StatusCode::CONFLICT
            }

            Self::Closed => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,

            Self::MigrationError { .. }
            | Self::InternalServerError { .. }
            | Self::Sqlx { .. }
            | Self::Serialization { .. } => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
