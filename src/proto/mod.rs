//! LDAP wire envelope.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → reader.rs (buffer, split into complete messages)
//!     → pdu.rs (message id + protocol op tag)
//!     → routed / relayed with a rewritten message id
//! ```
//!
//! # Design Decisions
//! - The balancer never decodes protocol op payloads
//! - Malformed input is an error for that connection only
//! - Responses the balancer originates are plain LDAPResults

pub mod ber;
pub mod pdu;
pub mod reader;

pub use pdu::{Pdu, ResultCode, STARTTLS_OID};
pub use reader::PduReader;

use thiserror::Error;

/// Errors raised while framing or decoding a PDU.
#[derive(Debug, Error)]
pub enum PduError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed PDU: {0}")]
    Malformed(&'static str),

    #[error("PDU of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("stream ended inside a PDU")]
    Truncated,
}

/// Protocol op tags (RFC 4511 application tags).
pub mod tag {
    pub const BIND_REQUEST: u8 = 0x60;
    pub const BIND_RESPONSE: u8 = 0x61;
    pub const UNBIND_REQUEST: u8 = 0x42;
    pub const SEARCH_REQUEST: u8 = 0x63;
    pub const SEARCH_RESULT_ENTRY: u8 = 0x64;
    pub const SEARCH_RESULT_DONE: u8 = 0x65;
    pub const SEARCH_RESULT_REFERENCE: u8 = 0x73;
    pub const MODIFY_REQUEST: u8 = 0x66;
    pub const MODIFY_RESPONSE: u8 = 0x67;
    pub const ADD_REQUEST: u8 = 0x68;
    pub const ADD_RESPONSE: u8 = 0x69;
    pub const DELETE_REQUEST: u8 = 0x4a;
    pub const DELETE_RESPONSE: u8 = 0x6b;
    pub const MODDN_REQUEST: u8 = 0x6c;
    pub const MODDN_RESPONSE: u8 = 0x6d;
    pub const COMPARE_REQUEST: u8 = 0x6e;
    pub const COMPARE_RESPONSE: u8 = 0x6f;
    pub const ABANDON_REQUEST: u8 = 0x50;
    pub const EXTENDED_REQUEST: u8 = 0x77;
    pub const EXTENDED_RESPONSE: u8 = 0x78;
    pub const INTERMEDIATE_RESPONSE: u8 = 0x79;

    /// Tag of the final response to a request, if the request has one.
    pub fn response_tag_for(request: u8) -> Option<u8> {
        match request {
            BIND_REQUEST => Some(BIND_RESPONSE),
            SEARCH_REQUEST => Some(SEARCH_RESULT_DONE),
            MODIFY_REQUEST => Some(MODIFY_RESPONSE),
            ADD_REQUEST => Some(ADD_RESPONSE),
            DELETE_REQUEST => Some(DELETE_RESPONSE),
            MODDN_REQUEST => Some(MODDN_RESPONSE),
            COMPARE_REQUEST => Some(COMPARE_RESPONSE),
            EXTENDED_REQUEST => Some(EXTENDED_RESPONSE),
            _ => None,
        }
    }

    /// Abandon and unbind are the only requests without a response.
    pub fn expects_response(request: u8) -> bool {
        response_tag_for(request).is_some()
    }

    pub fn is_request(tag: u8) -> bool {
        response_tag_for(tag).is_some() || tag == ABANDON_REQUEST || tag == UNBIND_REQUEST
    }

    /// Whether a response ends its operation.
    pub fn is_terminal_response(tag: u8) -> bool {
        !matches!(
            tag,
            SEARCH_RESULT_ENTRY | SEARCH_RESULT_REFERENCE | INTERMEDIATE_RESPONSE
        )
    }

    pub fn name(tag: u8) -> &'static str {
        match tag {
            BIND_REQUEST => "bind",
            UNBIND_REQUEST => "unbind",
            SEARCH_REQUEST => "search",
            MODIFY_REQUEST => "modify",
            ADD_REQUEST => "add",
            DELETE_REQUEST => "delete",
            MODDN_REQUEST => "modrdn",
            COMPARE_REQUEST => "compare",
            ABANDON_REQUEST => "abandon",
            EXTENDED_REQUEST => "extended",
            _ => "unknown",
        }
    }
}
