//! Typed header names used by the manager protocol itself.

/// Error returned when parsing an unrecognized header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmiHeaderError(pub String);

impl std::fmt::Display for ParseAmiHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AMI header: {}", self.0)
    }
}

impl std::error::Error for ParseAmiHeaderError {}

define_header_enum! {
    error_type: ParseAmiHeaderError,
    /// Header names with protocol meaning: classification, correlation,
    /// authentication and command output.
    ///
    /// Event payload headers (`Peer`, `Channel`, ...) are free-form and looked
    /// up by string. Use with [`Message::header()`](crate::Message::header)
    /// and [`Action::header()`](crate::Action::header).
    pub enum AmiHeader {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Event => "Event",
        Message => "Message",
        Privilege => "Privilege",
        EventList => "EventList",
        Username => "Username",
        Secret => "Secret",
        Events => "Events",
        EventMask => "EventMask",
        Command => "Command",
        Output => "Output",
    }
}

/// Error returned when parsing an unrecognized `Response` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResponseStatusError(pub String);

impl std::fmt::Display for ParseResponseStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown response status: {}", self.0)
    }
}

impl std::error::Error for ParseResponseStatusError {}

define_header_enum! {
    error_type: ParseResponseStatusError,
    /// Values of the `Response` header.
    pub enum ResponseStatus {
        Success => "Success",
        /// Free-form output follows the headers (CLI `Command` action).
        Follows => "Follows",
        Failed => "Failed",
        Error => "Error",
        /// Reply to `Logoff`.
        Goodbye => "Goodbye",
    }
}

impl ResponseStatus {
    /// `true` for statuses that mean the action was carried out.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ResponseStatus::Success | ResponseStatus::Follows | ResponseStatus::Goodbye
        )
    }
}
