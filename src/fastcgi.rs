/*! Constants and models for FastCGI wire records.

Every byte on a FastCGI transport belongs to a record: an 8 byte header,
`content_length` bytes of content and `padding_length` bytes of padding that
align the whole record to 8 bytes. All multi-byte integers are big-endian.

```
    use blocking_fcgi::fastcgi::{NameValuePair, put_pair};
    use bytes::BytesMut;

    let mut body = BytesMut::new();
    put_pair(&mut body, b"SCRIPT_FILENAME", b"/home/daniel/Public/test.php");
    let pairs = NameValuePair::pairs_from(body.freeze(), 1).unwrap();
    assert_eq!(&pairs[0].name[..], b"SCRIPT_FILENAME");
```
*/
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;

use crate::error::{Error, Result};

/// FCGI record header
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) rtype: u8,
    // A request ID R becomes active when the application receives a record
    // {FCGI_BEGIN_REQUEST, R, ...} and becomes inactive when the application
    // sends a record {FCGI_END_REQUEST, R, ...} to the Web server.
    // Management records have a requestId value of zero.
    pub(crate) request_id: u16,
    pub(crate) content_length: u16,
    pub(crate) padding_length: u8, // align by 8
}

/// Record type namespace.
pub(crate) struct Record;

impl Record {
    /// Request id component of Header used by management records only
    pub(crate) const MGMT_REQUEST_ID: u16 = 0;

    /// type component of Header
    /// # Request
    /// The Web server sends a FCGI_BEGIN_REQUEST record to start a request
    pub(crate) const BEGIN_REQUEST: u8 = 1;

    /// type component of Header
    /// # Request
    /// A Web server aborts a FastCGI request when an HTTP client closes its
    /// transport connection while the FastCGI request is running
    #[allow(dead_code)]
    pub(crate) const ABORT_REQUEST: u8 = 2;

    /// type component of Header
    /// # Response
    /// The application sends a FCGI_END_REQUEST record to terminate a request
    pub(crate) const END_REQUEST: u8 = 3;

    /// type component of Header
    /// # Request
    /// Receive name-value pairs from the Web server to the application
    pub(crate) const PARAMS: u8 = 4;

    /// type component of Header
    /// # Request
    /// Byte Stream
    pub(crate) const STDIN: u8 = 5;

    /// type component of Header
    /// # Response
    /// Byte Stream
    pub(crate) const STDOUT: u8 = 6;

    /// type component of Header
    /// # Response
    /// Byte Stream
    #[allow(dead_code)]
    pub(crate) const STDERR: u8 = 7;

    /// type component of Header
    /// # Request
    /// Byte Stream
    pub(crate) const DATA: u8 = 8;

    /// type component of Header
    /// # Request
    /// The Web server can query specific variables within the application
    pub(crate) const GET_VALUES: u8 = 9;

    /// type component of Header
    /// # Response
    /// The answer to a FCGI_GET_VALUES query
    pub(crate) const GET_VALUES_RESULT: u8 = 10;

    /// type component of Header
    ///
    /// Unrecognized management record
    pub(crate) const UNKNOWN_TYPE: u8 = 11;
}

/// FastCGI role of the application serving a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// emulated CGI/1.1 program
    Responder = 1,
    /// authorized/unauthorized decision
    Authorizer = 2,
    /// extra stream of data from a file
    Filter = 3,
}

impl Role {
    pub(crate) fn from_u16(raw: u16) -> Option<Role> {
        match raw {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// A type of stream carried in records of the same numeric type.
///
/// `Params`, `In` and `Data` flow client to server; `Out` and `Err` flow
/// server to client. A client-to-server stream ends with an empty record of
/// its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Params = 4,
    In = 5,
    Out = 6,
    Err = 7,
    Data = 8,
}

impl StreamType {
    #[inline]
    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

impl Header {
    /// Number of bytes in a Header.
    ///
    /// Future versions of the protocol will not reduce this number.
    pub(crate) const LEN: usize = 8;

    /// version component of Header
    const VERSION_1: u8 = 1;

    /// The maximum content length per record.
    pub(crate) const MAX_CONTENT_LENGTH: usize = 0xffff;

    /// The maximum padding length per record.
    pub(crate) const MAX_PADDING_LENGTH: usize = 0xff;

    /// New header with the minimum padding that aligns the record to 8 bytes.
    pub(crate) fn new(rtype: u8, request_id: u16, len: u16) -> Header {
        Header::with_padding(rtype, request_id, len, padding_for(len as usize) as u8)
    }

    pub(crate) fn with_padding(rtype: u8, request_id: u16, len: u16, pad: u8) -> Header {
        Header {
            rtype,
            request_id,
            content_length: len,
            padding_length: pad,
        }
    }

    /// Decodes a header, rejecting any protocol version other than 1.
    pub(crate) fn parse(data: &[u8; Header::LEN]) -> Result<Header> {
        if data[0] != Header::VERSION_1 {
            return Err(Error::protocol("unsupported protocol version"));
        }
        let h = Header {
            rtype: data[1],
            request_id: u16::from_be_bytes([data[2], data[3]]),
            content_length: u16::from_be_bytes([data[4], data[5]]),
            padding_length: data[6],
            // data[7] reserved
        };
        trace!(
            "h type {} id {} len {} pad {}",
            h.rtype,
            h.request_id,
            h.content_length,
            h.padding_length
        );
        Ok(h)
    }

    pub(crate) fn write_to(&self, data: &mut [u8]) {
        data[0] = Header::VERSION_1;
        data[1] = self.rtype;
        data[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        data[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        data[6] = self.padding_length;
        data[7] = 0; // reserved
    }

    #[inline]
    pub(crate) fn is_management(&self) -> bool {
        self.request_id == Record::MGMT_REQUEST_ID
    }
}

/// Padding that aligns `8 + len` to the next multiple of 8.
#[inline]
pub(crate) fn padding_for(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Body of a begin-request record: role plus control flags.
pub(crate) struct BeginRequestBody {
    role: u16,
    flags: u8,
}

impl BeginRequestBody {
    /// Mask for flags component of BeginRequestBody
    ///
    /// Instructs the application to not close the connection after responding
    /// to the request
    pub(crate) const KEEP_CONN: u8 = 1;

    /// The length of the body. A begin-request record carries exactly this
    /// much content.
    pub(crate) const LEN: usize = 8;

    pub(crate) fn parse(data: &[u8; BeginRequestBody::LEN]) -> BeginRequestBody {
        BeginRequestBody {
            role: u16::from_be_bytes([data[0], data[1]]),
            flags: data[2],
            // data[3..8] reserved
        }
    }

    pub(crate) fn raw_role(&self) -> u16 {
        self.role
    }

    pub(crate) fn role(&self) -> Option<Role> {
        Role::from_u16(self.role)
    }

    pub(crate) fn is_keep_conn(&self) -> bool {
        self.flags & BeginRequestBody::KEEP_CONN != 0
    }
}

/// Body of an end-request record.
pub(crate) struct EndRequestBody;

impl EndRequestBody {
    /// protocol_status component of EndRequestBody
    ///
    /// Normal end of request
    pub(crate) const REQUEST_COMPLETE: u8 = 0;

    /// protocol_status component of EndRequestBody
    ///
    /// Application is designed to process one request at a time per connection
    pub(crate) const CANT_MPX_CONN: u8 = 1;

    /// protocol_status component of EndRequestBody
    ///
    /// The application runs out of some resource, e.g. database connections
    #[allow(dead_code)]
    pub(crate) const OVERLOADED: u8 = 2;

    /// protocol_status component of EndRequestBody
    ///
    /// Web server has specified a role that is unknown to the application
    pub(crate) const UNKNOWN_ROLE: u8 = 3;

    /// A complete end-request record: header plus 8-byte body, no padding.
    pub(crate) fn record(request_id: u16, app_status: u32, protocol_status: u8) -> [u8; 16] {
        let mut rec = [0u8; 16];
        Header::with_padding(Record::END_REQUEST, request_id, 8, 0).write_to(&mut rec[..8]);
        rec[8..12].copy_from_slice(&app_status.to_be_bytes());
        rec[12] = protocol_status;
        // rec[13..16] reserved
        rec
    }
}

/// Body of an unknown-type record.
pub(crate) struct UnknownTypeBody;

impl UnknownTypeBody {
    /// A complete unknown-type record answering a management record of
    /// unrecognized type `rtype`.
    pub(crate) fn record(rtype: u8) -> [u8; 16] {
        let mut rec = [0u8; 16];
        Header::with_padding(Record::UNKNOWN_TYPE, Record::MGMT_REQUEST_ID, 8, 0)
            .write_to(&mut rec[..8]);
        rec[8] = rtype;
        // rec[9..16] reserved
        rec
    }
}

/// Names for GET_VALUES / GET_VALUES_RESULT records.
///
/// The maximum number of concurrent transport connections this application
/// will accept, e.g. "1" or "10".
pub const MAX_CONNS: &[u8] = b"FCGI_MAX_CONNS";

/// Names for GET_VALUES / GET_VALUES_RESULT records.
///
/// The maximum number of concurrent requests this application will accept,
/// e.g. "1" or "50".
pub const MAX_REQS: &[u8] = b"FCGI_MAX_REQS";

/// Names for GET_VALUES / GET_VALUES_RESULT records.
///
/// "0" if this application does not multiplex connections (i.e. handle
/// concurrent requests over each connection), "1" otherwise.
pub const MPXS_CONNS: &[u8] = b"FCGI_MPXS_CONNS";

// ----------------- name-value pairs -----------------

/// One decoded name-value pair.
///
/// Name and value are cheap slices into the stream they were decoded from.
pub struct NameValuePair {
    pub name: Bytes,
    pub value: Bytes,
}

impl NameValuePair {
    /// Decodes one pair from the front of `data`.
    ///
    /// A pair is four concatenated items: name length, value length, name
    /// bytes, value bytes. Lengths of 127 bytes and less are encoded in one
    /// byte, while longer lengths are always encoded in four bytes.
    pub fn parse(data: &mut Bytes) -> Result<NameValuePair> {
        let name_length = param_length(data)?;
        let value_length = param_length(data)?;
        if data.remaining() < name_length + value_length {
            return Err(Error::protocol("truncated FastCGI name-value pair"));
        }
        let name = data.split_to(name_length);
        let value = data.split_to(value_length);
        Ok(NameValuePair { name, value })
    }

    /// Decodes pairs until `data` is exhausted.
    ///
    /// `reserve` is the number of pairs for which memory is allocated at once.
    pub fn pairs_from(mut data: Bytes, reserve: usize) -> Result<Vec<NameValuePair>> {
        let mut pairs = Vec::with_capacity(reserve);
        while data.has_remaining() {
            pairs.push(NameValuePair::parse(&mut data)?);
        }
        Ok(pairs)
    }
}

impl std::fmt::Debug for NameValuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} = {:?}", self.name, self.value)
    }
}

fn param_length(data: &mut Bytes) -> Result<usize> {
    if !data.has_remaining() {
        return Err(Error::protocol("truncated FastCGI name-value length"));
    }
    let first = data.get_u8();
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    if data.remaining() < 3 {
        return Err(Error::protocol("truncated FastCGI name-value length"));
    }
    let b = [data.get_u8(), data.get_u8(), data.get_u8()];
    Ok((((first & 0x7f) as usize) << 24)
        + ((b[0] as usize) << 16)
        + ((b[1] as usize) << 8)
        + b[2] as usize)
}

/// Appends one encoded name-value pair to `buf`.
pub fn put_pair(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_length(buf, name.len());
    put_length(buf, value.len());
    buf.put_slice(name);
    buf.put_slice(value);
}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len <= 0x7f {
        buf.put_u8(len as u8);
    } else {
        debug_assert!(len <= 0x7fff_ffff);
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}
