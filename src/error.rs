//! Error types for Meridian

use axum::http::StatusCode;

/// Result type alias for Meridian operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an error, used by the HTTP boundary to pick a
/// status code without matching on message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A referenced entity does not exist
    NotFound,
    /// Duplicate creation of an existing entity
    AlreadyExists,
    /// The request itself is malformed or violates a schema rule
    Validation,
    /// Missing or bad credentials
    Authentication,
    /// Authenticated but not permitted
    Authorization,
    /// Cluster-level failure (broker unreachable, leadership unknown)
    Cluster,
    /// Invariant failure inside the server
    Internal,
}

/// Error types for Meridian.
///
/// Message strings are part of the wire contract and must stay stable;
/// no two variants share a message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening an already open server
    #[error("server already open")]
    ServerOpen,
    /// Closing an already closed server
    #[error("server already closed")]
    ServerClosed,
    /// A server cannot join a cluster
    #[error("unable to join")]
    UnableToJoin,
    /// Creating a data node without a URL
    #[error("data node url required")]
    DataNodeUrlRequired,
    /// Creating a duplicate data node
    #[error("data node exists")]
    DataNodeExists,
    /// Dropping a non-existent data node
    #[error("data node not found")]
    DataNodeNotFound,
    /// Creating a database without a name
    #[error("database name required")]
    DatabaseNameRequired,
    /// Creating a duplicate database
    #[error("database exists")]
    DatabaseExists,
    /// Referencing a non-existent database
    #[error("database not found: {0:?}")]
    DatabaseNotFound(String),
    /// Using a blank database name on an operation that requires one
    #[error("database is required")]
    DatabaseRequired,
    /// Creating a duplicate user
    #[error("user exists")]
    UserExists,
    /// Deleting a non-existent user
    #[error("user not found")]
    UserNotFound,
    /// Using a blank username
    #[error("username required")]
    UsernameRequired,
    /// A username with invalid characters
    #[error("invalid username")]
    InvalidUsername,
    /// Creating a duplicate retention policy
    #[error("retention policy exists")]
    RetentionPolicyExists,
    /// Referencing a non-existent retention policy
    #[error("retention policy not found")]
    RetentionPolicyNotFound,
    /// Using a blank retention policy name
    #[error("retention policy name required")]
    RetentionPolicyNameRequired,
    /// Using the default policy on a database with no default set
    #[error("default retention policy not found")]
    DefaultRetentionPolicyNotFound,
    /// Writing to a non-existent shard
    #[error("shard not found")]
    ShardNotFound,
    /// A point whose timestamp falls before the retention window
    #[error("retention exceeded")]
    RetentionExceeded,
    /// A point whose timestamp is too far ahead of the server clock
    #[error("timestamp too far in the future")]
    TimestampTooFarInFuture,
    /// A point without a measurement name
    #[error("measurement name required")]
    MeasurementNameRequired,
    /// A measurement that does not exist
    #[error("measurement not found")]
    MeasurementNotFound,
    /// A point without any values
    #[error("values required")]
    ValuesRequired,
    /// Too many fields created on a measurement
    #[error("field overflow")]
    FieldOverflow,
    /// A write using a conflicting type for an existing field
    #[error("field type conflict: {0}")]
    FieldTypeConflict(String),
    /// A tag key colliding with a field key on the same point
    #[error("tag and field keys must be distinct: {0}")]
    TagFieldKeyConflict(String),
    /// Looking up a non-existent series
    #[error("series not found")]
    SeriesNotFound,
    /// Assigning an id to a series that already exists
    #[error("series already exists")]
    SeriesExists,
    /// A statement skipped because an earlier statement failed
    #[error("not executed")]
    NotExecuted,
    /// An unknown or malformed query statement
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// An invalid privilege in a grant or revoke
    #[error("invalid privilege requested")]
    InvalidGrantRevoke,
    /// Creating a duplicate continuous query
    #[error("continuous query already exists")]
    ContinuousQueryExists,
    /// Dropping a non-existent continuous query
    #[error("continuous query not found")]
    ContinuousQueryNotFound,
    /// Missing or unparsable credentials
    #[error("unable to parse authentication credentials")]
    CredentialsRequired,
    /// A failed password check
    #[error("invalid password")]
    InvalidPassword,
    /// An authenticated user lacking a required privilege.
    ///
    /// Kept as a dedicated variant so the HTTP layer can map authorization
    /// failures to a status code without inspecting message text.
    #[error("{user:?} user is not authorized to {privilege} on database {database:?}")]
    Unauthorized {
        user: String,
        privilege: &'static str,
        database: String,
    },
    /// The broker rejected or could not order a proposal
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    /// A metastore snapshot that fails framing or checksum validation
    #[error("invalid metastore snapshot: {0}")]
    InvalidSnapshot(String),
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error for the HTTP boundary.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            DataNodeNotFound
            | DatabaseNotFound(_)
            | UserNotFound
            | RetentionPolicyNotFound
            | ShardNotFound
            | MeasurementNotFound
            | SeriesNotFound
            | ContinuousQueryNotFound => ErrorKind::NotFound,
            DataNodeExists
            | DatabaseExists
            | UserExists
            | RetentionPolicyExists
            | SeriesExists
            | ContinuousQueryExists => ErrorKind::AlreadyExists,
            DataNodeUrlRequired
            | DatabaseNameRequired
            | DatabaseRequired
            | UsernameRequired
            | InvalidUsername
            | RetentionPolicyNameRequired
            | DefaultRetentionPolicyNotFound
            | RetentionExceeded
            | TimestampTooFarInFuture
            | MeasurementNameRequired
            | ValuesRequired
            | FieldOverflow
            | FieldTypeConflict(_)
            | TagFieldKeyConflict(_)
            | NotExecuted
            | InvalidQuery(_)
            | InvalidGrantRevoke
            | Config(_) => ErrorKind::Validation,
            CredentialsRequired | InvalidPassword => ErrorKind::Authentication,
            Unauthorized { .. } => ErrorKind::Authorization,
            UnableToJoin | BrokerUnavailable(_) => ErrorKind::Cluster,
            ServerOpen | ServerClosed | InvalidSnapshot(_) | Io(_) | Serialization(_)
            | Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::UNAUTHORIZED,
            ErrorKind::Cluster => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True if this error must not leak its message to the client.
    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_wire_messages() {
        assert_eq!(Error::DatabaseExists.to_string(), "database exists");
        assert_eq!(
            Error::DefaultRetentionPolicyNotFound.to_string(),
            "default retention policy not found"
        );
        assert_eq!(Error::DataNodeUrlRequired.to_string(), "data node url required");
        assert_eq!(Error::SeriesExists.to_string(), "series already exists");
        assert_eq!(Error::NotExecuted.to_string(), "not executed");
        assert_eq!(Error::FieldOverflow.to_string(), "field overflow");
    }

    #[test]
    fn no_two_sentinels_share_a_message() {
        let all = vec![
            Error::ServerOpen,
            Error::ServerClosed,
            Error::UnableToJoin,
            Error::DataNodeUrlRequired,
            Error::DataNodeExists,
            Error::DataNodeNotFound,
            Error::DatabaseNameRequired,
            Error::DatabaseExists,
            Error::DatabaseRequired,
            Error::UserExists,
            Error::UserNotFound,
            Error::UsernameRequired,
            Error::InvalidUsername,
            Error::RetentionPolicyExists,
            Error::RetentionPolicyNotFound,
            Error::RetentionPolicyNameRequired,
            Error::DefaultRetentionPolicyNotFound,
            Error::ShardNotFound,
            Error::RetentionExceeded,
            Error::TimestampTooFarInFuture,
            Error::MeasurementNameRequired,
            Error::MeasurementNotFound,
            Error::ValuesRequired,
            Error::FieldOverflow,
            Error::SeriesNotFound,
            Error::SeriesExists,
            Error::NotExecuted,
            Error::InvalidGrantRevoke,
            Error::ContinuousQueryExists,
            Error::ContinuousQueryNotFound,
            Error::CredentialsRequired,
            Error::InvalidPassword,
        ];
        let mut seen = std::collections::HashSet::new();
        for err in &all {
            assert!(seen.insert(err.to_string()), "duplicate message: {err}");
        }
    }

    #[test]
    fn authorization_errors_are_tagged() {
        let err = Error::Unauthorized {
            user: "bob".into(),
            privilege: "write",
            database: "metrics".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(Error::DatabaseNotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::DatabaseExists.status(), StatusCode::CONFLICT);
        assert_eq!(Error::ValuesRequired.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::CredentialsRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::BrokerUnavailable("no leader".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::Internal("assert failed".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
