//! LDAPMessage envelope handling.

use bytes::{BufMut, Bytes, BytesMut};

use crate::proto::ber::{self, Header};
use crate::proto::{tag, PduError};

/// Request name of the StartTLS extended operation.
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// LDAP result codes produced or interpreted by the balancer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    AdminLimitExceeded = 11,
    SaslBindInProgress = 14,
    Busy = 51,
    Unavailable = 52,
    Other = 80,
}

/// One complete LDAPMessage.
///
/// Only the envelope is interpreted: the message id and the tag of the
/// protocol op. Everything after the message id is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    msgid: i32,
    tag: u8,
    raw: Bytes,
    /// Offset of the protocol op inside `raw`.
    op_offset: usize,
}

impl Pdu {
    /// Parse a complete message.
    pub fn parse(raw: Bytes) -> Result<Self, PduError> {
        let (outer, content) = ber::read_element(&raw)?;
        if outer.tag != ber::SEQUENCE {
            return Err(PduError::Malformed("envelope is not a SEQUENCE"));
        }
        if outer.total_len() != raw.len() {
            return Err(PduError::Malformed("trailing bytes after envelope"));
        }

        let (id_header, id_content) = ber::read_element(content)?;
        if id_header.tag != ber::INTEGER {
            return Err(PduError::Malformed("message id is not an INTEGER"));
        }
        let msgid = message_id(ber::read_int(id_content)?)?;

        let op_offset = outer.header_len + id_header.total_len();
        let op_tag = *raw
            .get(op_offset)
            .ok_or(PduError::Malformed("missing protocol op"))?;
        ber::read_element(&raw[op_offset..])?;

        Ok(Self {
            msgid,
            tag: op_tag,
            raw,
            op_offset,
        })
    }

    pub fn msgid(&self) -> i32 {
        self.msgid
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The encoded message.
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    /// Re-encode the envelope under a different message id.
    pub fn with_msgid(&self, msgid: i32) -> Pdu {
        let rest = &self.raw[self.op_offset..];
        let mut body = BytesMut::with_capacity(rest.len() + 6);
        ber::put_int(&mut body, ber::INTEGER, msgid as i64);
        let id_len = body.len();
        body.extend_from_slice(rest);

        let mut out = BytesMut::with_capacity(body.len() + 6);
        out.put_u8(ber::SEQUENCE);
        ber::put_len(&mut out, body.len());
        let header_len = out.len();
        out.extend_from_slice(&body);

        Pdu {
            msgid,
            tag: self.tag,
            raw: out.freeze(),
            op_offset: header_len + id_len,
        }
    }

    fn op(&self) -> Result<(Header, &[u8]), PduError> {
        ber::read_element(&self.raw[self.op_offset..])
    }

    /// Result code of an LDAPResult-shaped response.
    pub fn result_code(&self) -> Result<u32, PduError> {
        let (_, content) = self.op()?;
        let (header, value) = ber::read_element(content)?;
        if header.tag != ber::ENUMERATED {
            return Err(PduError::Malformed("resultCode is not ENUMERATED"));
        }
        Ok(ber::read_int(value)? as u32)
    }

    /// Message id targeted by an AbandonRequest.
    pub fn abandon_target(&self) -> Result<i32, PduError> {
        if self.tag != tag::ABANDON_REQUEST {
            return Err(PduError::Malformed("not an abandon request"));
        }
        let (_, content) = self.op()?;
        message_id(ber::read_int(content)?)
    }

    /// Request name of an ExtendedRequest.
    pub fn extended_oid(&self) -> Result<String, PduError> {
        if self.tag != tag::EXTENDED_REQUEST {
            return Err(PduError::Malformed("not an extended request"));
        }
        let (_, content) = self.op()?;
        let (header, value) = ber::read_element(content)?;
        if header.tag != ber::CONTEXT_0 {
            return Err(PduError::Malformed("missing requestName"));
        }
        Ok(String::from_utf8_lossy(value).into_owned())
    }

    /// Build an LDAPResult response.
    pub fn result(msgid: i32, op_tag: u8, code: ResultCode, diagnostic: &str) -> Pdu {
        let mut result = BytesMut::new();
        ber::put_int(&mut result, ber::ENUMERATED, code as i64);
        ber::put_bytes(&mut result, ber::OCTET_STRING, b"");
        ber::put_bytes(&mut result, ber::OCTET_STRING, diagnostic.as_bytes());
        Self::envelope(msgid, op_tag, &result)
    }

    /// Build a simple BindRequest (LDAPv3).
    pub fn simple_bind(msgid: i32, dn: &str, password: &str) -> Pdu {
        let mut bind = BytesMut::new();
        ber::put_int(&mut bind, ber::INTEGER, 3);
        ber::put_bytes(&mut bind, ber::OCTET_STRING, dn.as_bytes());
        ber::put_bytes(&mut bind, ber::CONTEXT_0, password.as_bytes());
        Self::envelope(msgid, tag::BIND_REQUEST, &bind)
    }

    /// Build an AbandonRequest for `target`.
    pub fn abandon(msgid: i32, target: i32) -> Pdu {
        let mut body = BytesMut::new();
        ber::put_int(&mut body, ber::INTEGER, msgid as i64);
        let op_offset = body.len();
        ber::put_int(&mut body, tag::ABANDON_REQUEST, target as i64);
        Self::wrap(msgid, tag::ABANDON_REQUEST, body, op_offset)
    }

    fn envelope(msgid: i32, op_tag: u8, op_content: &[u8]) -> Pdu {
        let mut body = BytesMut::new();
        ber::put_int(&mut body, ber::INTEGER, msgid as i64);
        let op_offset = body.len();
        ber::put_bytes(&mut body, op_tag, op_content);
        Self::wrap(msgid, op_tag, body, op_offset)
    }

    fn wrap(msgid: i32, op_tag: u8, body: BytesMut, op_offset: usize) -> Pdu {
        let mut out = BytesMut::with_capacity(body.len() + 6);
        out.put_u8(ber::SEQUENCE);
        ber::put_len(&mut out, body.len());
        let header_len = out.len();
        out.extend_from_slice(&body);
        Pdu {
            msgid,
            tag: op_tag,
            raw: out.freeze(),
            op_offset: header_len + op_offset,
        }
    }
}

/// MessageID ::= INTEGER (0 .. maxInt)
fn message_id(value: i64) -> Result<i32, PduError> {
    i32::try_from(value)
        .ok()
        .filter(|id| *id >= 0)
        .ok_or(PduError::Malformed("message id out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_request(msgid: i32) -> Pdu {
        // baseObject search for "" with (objectClass=*)
        let mut op = BytesMut::new();
        ber::put_bytes(&mut op, ber::OCTET_STRING, b"");
        ber::put_int(&mut op, ber::ENUMERATED, 0);
        ber::put_int(&mut op, ber::ENUMERATED, 0);
        ber::put_int(&mut op, ber::INTEGER, 0);
        ber::put_int(&mut op, ber::INTEGER, 0);
        op.extend_from_slice(&[0x01, 0x01, 0x00]);
        ber::put_bytes(&mut op, 0x87, b"objectClass");
        op.extend_from_slice(&[0x30, 0x00]);
        Pdu::envelope(msgid, tag::SEARCH_REQUEST, &op)
    }

    #[test]
    fn parses_envelope() {
        let pdu = search_request(7);
        let parsed = Pdu::parse(pdu.as_bytes().clone()).unwrap();
        assert_eq!(parsed.msgid(), 7);
        assert_eq!(parsed.tag(), tag::SEARCH_REQUEST);
    }

    #[test]
    fn rewrite_preserves_payload() {
        let pdu = search_request(1);
        let rewritten = pdu.with_msgid(70000);
        assert_eq!(rewritten.msgid(), 70000);
        assert_eq!(rewritten.tag(), tag::SEARCH_REQUEST);

        let reparsed = Pdu::parse(rewritten.as_bytes().clone()).unwrap();
        assert_eq!(reparsed.msgid(), 70000);
        assert_eq!(
            &reparsed.as_bytes()[reparsed.op_offset..],
            &pdu.as_bytes()[pdu.op_offset..]
        );
    }

    #[test]
    fn result_code_of_built_response() {
        let res = Pdu::result(3, tag::BIND_RESPONSE, ResultCode::Busy, "try later");
        let parsed = Pdu::parse(res.into_bytes()).unwrap();
        assert_eq!(parsed.tag(), tag::BIND_RESPONSE);
        assert_eq!(parsed.result_code().unwrap(), ResultCode::Busy as u32);
    }

    #[test]
    fn abandon_round_trip() {
        let pdu = Pdu::abandon(9, 4);
        let parsed = Pdu::parse(pdu.into_bytes()).unwrap();
        assert_eq!(parsed.abandon_target().unwrap(), 4);
    }

    #[test]
    fn abandon_of_out_of_range_id_is_malformed() {
        // abandon 2^31
        let raw = Bytes::from_static(&[
            0x30, 0x0a, 0x02, 0x01, 0x09, 0x50, 0x05, 0x00, 0x80, 0x00, 0x00, 0x00,
        ]);
        let pdu = Pdu::parse(raw).unwrap();
        assert!(pdu.abandon_target().is_err());
    }

    #[test]
    fn rejects_non_sequence() {
        let raw = Bytes::from_static(&[0x31, 0x03, 0x02, 0x01, 0x01]);
        assert!(Pdu::parse(raw).is_err());
    }

    #[test]
    fn rejects_negative_msgid() {
        let raw = Bytes::from_static(&[0x30, 0x05, 0x02, 0x01, 0xff, 0x42, 0x00]);
        assert!(Pdu::parse(raw).is_err());
    }
}
