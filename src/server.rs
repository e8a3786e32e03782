/*! A single FastCGI request served over one transport connection.

A [`ServerConnection`] is produced by the listener after a valid opening
handshake. Construction drains the `Params` stream into the parameter
table, then rewires the reader to `In` for responders and filters. The
application reads its input, writes its output and diagnostics, sets the
application status and closes; closing transmits the stream terminators
and the final end-request record.

A connection is single threaded by construction: every operation takes
`&mut self`, and the reader and writers borrow the transport only for the
duration of one call.
*/
use bytes::BytesMut;
use log::error;

use crate::error::{Error, Result};
use crate::fastcgi::{NameValuePair, Role, StreamType};
use crate::stream::{StreamReader, StreamWriter, READER_BUFFER_SIZE, WRITER_BUFFER_SIZE};
use crate::transport::Transport;

/// Line terminator of a CGI response header.
pub const CRLF: &[u8] = b"\r\n";

/// Terminates the whole CGI response header block.
pub const CRLFCRLF: &[u8] = b"\r\n\r\n";

/// The decoded `Params` stream: ordered pairs with by-name lookup.
pub struct Parameters {
    pairs: Vec<NameValuePair>,
}

impl Parameters {
    /// The number of pairs.
    pub fn count(&self) -> usize {
        self.pairs.len()
    }

    /// Index of the **first** pair named `name`.
    pub fn index_of(&self, name: &[u8]) -> Option<usize> {
        self.pairs.iter().position(|p| p.name == name)
    }

    /// The pair at `index`.
    pub fn pair(&self, index: usize) -> Result<&NameValuePair> {
        self.pairs
            .get(index)
            .ok_or(Error::InvalidArgument("parameter index out of range"))
    }

    /// Value of the first pair named `name`.
    pub fn value(&self, name: &[u8]) -> Option<&[u8]> {
        self.index_of(name).map(|i| &self.pairs[i].value[..])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NameValuePair> {
        self.pairs.iter()
    }
}

/// One accepted FastCGI request: parameters, streams and status.
pub struct ServerConnection {
    io: Box<dyn Transport>,
    role: Role,
    request_id: u16,
    keep_connection: bool,
    application_status: u32,
    parameters: Parameters,
    reader: StreamReader,
    out: StreamWriter,
    err: StreamWriter,
}

impl ServerConnection {
    /// Builds the connection and pre-reads the complete `Params` stream.
    pub(crate) fn new(
        mut io: Box<dyn Transport>,
        role: Role,
        request_id: u16,
        keep_connection: bool,
    ) -> Result<ServerConnection> {
        let mut reader = StreamReader::new(StreamType::Params, READER_BUFFER_SIZE)?;
        let out = StreamWriter::new(StreamType::Out, WRITER_BUFFER_SIZE)?;
        let err = StreamWriter::new(StreamType::Err, WRITER_BUFFER_SIZE)?;

        // The params stream always comes first. Read it whole.
        let mut blob = BytesMut::with_capacity(1024);
        while reader.fill(io.as_mut(), request_id, role)? {
            let avail = reader.available();
            blob.extend_from_slice(avail);
            let count = avail.len();
            reader.consume(count);
        }
        let parameters = Parameters {
            pairs: NameValuePair::pairs_from(blob.freeze(), 32)?,
        };

        // Authorizers have no input stream; their reader stays at the end
        // of params.
        if role == Role::Responder || role == Role::Filter {
            reader.reset(StreamType::In);
        }

        Ok(ServerConnection {
            io,
            role,
            request_id,
            keep_connection,
            application_status: 0,
            parameters,
            reader,
            out,
            err,
        })
    }

    /// The request identifier. Always a non-zero value.
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// The role the application plays for this request.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The keep-connection flag of the begin-request record.
    ///
    /// Parsed and surfaced only; this library always closes the connection
    /// after the response.
    pub fn is_keep_connection(&self) -> bool {
        self.keep_connection
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// The status code transmitted to the client upon close. Default `0`.
    pub fn application_status(&self) -> u32 {
        self.application_status
    }

    pub fn set_application_status(&mut self, status: u32) {
        self.application_status = status;
    }

    /// Reads request input. `Ok(0)` means the stream ended.
    ///
    /// Responders and filters read the `In` stream here; for a filter the
    /// `Data` stream follows after `In` returns its first `Ok(0)`. An
    /// authorizer has no input and always gets `Ok(0)`.
    pub fn read_stdin(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(self.io.as_mut(), self.request_id, self.role, buf)
    }

    /// Appends all of `data` to the output stream.
    pub fn write_stdout(&mut self, data: &[u8]) -> Result<()> {
        self.out.write(self.io.as_mut(), self.request_id, data)
    }

    /// Appends all of `data` to the error stream.
    pub fn write_stderr(&mut self, data: &[u8]) -> Result<()> {
        self.err.write(self.io.as_mut(), self.request_id, data)
    }

    /// Sends buffered output as a record now.
    pub fn flush_stdout(&mut self) -> Result<()> {
        self.out.flush(self.io.as_mut(), self.request_id)
    }

    /// Sends buffered error output as a record now.
    pub fn flush_stderr(&mut self) -> Result<()> {
        self.err.flush(self.io.as_mut(), self.request_id)
    }

    /// Replaces the input buffer.
    ///
    /// The new size must be 8-aligned and within `[2048, 65528]`; the swap
    /// fails while record data is pending in the old buffer.
    pub fn set_stdin_buffer_size(&mut self, size: usize) -> Result<()> {
        self.reader.set_buffer_size(size)
    }

    /// Replaces the output buffer. Same constraints as for the input.
    pub fn set_stdout_buffer_size(&mut self, size: usize) -> Result<()> {
        self.out.set_buffer_size(size)
    }

    /// Replaces the error buffer. Same constraints as for the input.
    pub fn set_stderr_buffer_size(&mut self, size: usize) -> Result<()> {
        self.err.set_buffer_size(size)
    }

    /// `std::io::Read` view of the input stream.
    pub fn stdin(&mut self) -> Stdin<'_> {
        Stdin { con: self }
    }

    /// `std::io::Write` view of the output stream.
    pub fn stdout(&mut self) -> Stdout<'_> {
        Stdout { con: self }
    }

    /// `std::io::Write` view of the error stream.
    pub fn stderr(&mut self) -> Stderr<'_> {
        Stderr { con: self }
    }

    /// Closes the connection, transmitting the end records. Idempotent.
    ///
    /// Closing is implicit on drop; calling it explicitly is the way to
    /// observe errors.
    pub fn close(&mut self) -> Result<()> {
        // Attention: the order is important!
        self.close_writer(StreamType::Err)?;
        self.close_writer(StreamType::Out)?;
        self.reader.close();
        Ok(())
    }

    /// `true` once all three streams are closed.
    pub fn is_closed(&self) -> bool {
        self.err.is_closed() && self.out.is_closed() && self.reader.is_closed()
    }

    fn close_writer(&mut self, which: StreamType) -> Result<()> {
        let writer = match which {
            StreamType::Out => &mut self.out,
            _ => &mut self.err,
        };
        if writer.is_closed() {
            return Ok(());
        }
        debug_assert!(!self.reader.is_closed());
        debug_assert!(
            self.role == Role::Authorizer || self.reader.stream_type() != StreamType::Params
        );
        // A filter completes its output only after draining stdin (and
        // thereby moving on to the data stream).
        if self.role == Role::Filter
            && self.reader.stream_type() == StreamType::In
            && !self.reader.is_end_of_stream()
        {
            return Err(Error::FilterInputPending);
        }
        let status = if which == StreamType::Out {
            Some(self.application_status)
        } else {
            None
        };
        writer.finish(self.io.as_mut(), self.request_id, status)?;
        writer.close();
        Ok(())
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("error upon closing FastCGI connection: {}", e);
        }
        if let Err(e) = self.io.close() {
            error!("error upon closing FastCGI transport: {}", e);
        }
    }
}

/// Borrowed `std::io::Read` handle over the request input.
pub struct Stdin<'c> {
    con: &'c mut ServerConnection,
}

impl std::io::Read for Stdin<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.con.read_stdin(buf).map_err(Into::into)
    }
}

/// Borrowed `std::io::Write` handle over the output stream.
pub struct Stdout<'c> {
    con: &'c mut ServerConnection,
}

impl std::io::Write for Stdout<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.con.write_stdout(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(self.con.flush_stdout()?)
    }
}

/// Borrowed `std::io::Write` handle over the error stream.
pub struct Stderr<'c> {
    con: &'c mut ServerConnection,
}

impl std::io::Write for Stderr<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.con.write_stderr(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(self.con.flush_stderr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastcgi::{padding_for, put_pair, Header, Record};
    use crate::stream::tests::ScriptedIo;
    use std::io::{Read, Write};

    fn record(rtype: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
        let mut rec = vec![0u8; Header::LEN];
        Header::new(rtype, request_id, content.len() as u16).write_to(&mut rec);
        rec.extend_from_slice(content);
        rec.resize(rec.len() + padding_for(content.len()), 0);
        rec
    }

    fn params_record(request_id: u16, pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut body = BytesMut::new();
        for (name, value) in pairs {
            put_pair(&mut body, name, value);
        }
        record(Record::PARAMS, request_id, &body)
    }

    fn responder_io(stdin: &[u8]) -> ScriptedIo {
        let mut io = ScriptedIo::new();
        io.feed(&params_record(
            1,
            &[
                (b"SCRIPT_FILENAME", b"/home/daniel/Public/test.php"),
                (b"QUERY_STRING", b"lol=1"),
            ],
        ));
        io.feed(&record(Record::PARAMS, 1, b""));
        if !stdin.is_empty() {
            io.feed(&record(Record::STDIN, 1, stdin));
        }
        io.feed(&record(Record::STDIN, 1, b""));
        io
    }

    #[test]
    fn construction_reads_parameters() {
        let io = responder_io(b"");
        let con = ServerConnection::new(Box::new(io), Role::Responder, 1, false).unwrap();
        assert_eq!(con.request_id(), 1);
        assert_eq!(con.role(), Role::Responder);
        assert!(!con.is_keep_connection());
        let params = con.parameters();
        assert_eq!(params.count(), 2);
        assert_eq!(params.index_of(b"QUERY_STRING"), Some(1));
        assert_eq!(params.index_of(b"MISSING"), None);
        assert_eq!(
            params.value(b"SCRIPT_FILENAME"),
            Some(&b"/home/daniel/Public/test.php"[..])
        );
        assert_eq!(&params.pair(0).unwrap().name[..], b"SCRIPT_FILENAME");
        assert!(matches!(
            params.pair(2),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn params_may_span_records() {
        let mut io = ScriptedIo::new();
        io.feed(&params_record(1, &[(b"A", b"1")]));
        io.feed(&params_record(1, &[(b"B", b"2"), (b"A", b"3")]));
        io.feed(&record(Record::PARAMS, 1, b""));
        io.feed(&record(Record::STDIN, 1, b""));
        let con = ServerConnection::new(Box::new(io), Role::Responder, 1, false).unwrap();
        assert_eq!(con.parameters().count(), 3);
        // lookup returns the first match
        assert_eq!(con.parameters().index_of(b"A"), Some(0));
        assert_eq!(con.parameters().value(b"A"), Some(&b"1"[..]));
    }

    #[test]
    fn stdin_reads_the_in_stream() {
        let io = responder_io(b"test=123");
        let mut con = ServerConnection::new(Box::new(io), Role::Responder, 1, false).unwrap();
        let mut body = Vec::new();
        con.stdin().read_to_end(&mut body).unwrap();
        assert_eq!(body, b"test=123");
    }

    #[test]
    fn buffers_can_be_replaced_while_idle() {
        let io = responder_io(b"");
        let mut con = ServerConnection::new(Box::new(io), Role::Responder, 1, false).unwrap();
        con.set_stdin_buffer_size(4096).unwrap();
        con.set_stdout_buffer_size(8192).unwrap();
        con.set_stderr_buffer_size(2048).unwrap();
        assert!(matches!(
            con.set_stdout_buffer_size(1024),
            Err(Error::InvalidArgument(_))
        ));
        con.stdout().write_all(b"queued").unwrap();
        assert!(matches!(
            con.set_stdout_buffer_size(8192),
            Err(Error::InvalidArgument(_))
        ));
        con.close().unwrap();
    }

    #[test]
    fn empty_responder_emits_terminator_and_end_request() {
        let io = responder_io(b"");
        let written = io.written.clone();
        let mut con = ServerConnection::new(Box::new(io), Role::Responder, 1, false).unwrap();
        con.close().unwrap();
        assert!(con.is_closed());
        // close is idempotent
        con.close().unwrap();

        let mut expect = Vec::new();
        expect.extend_from_slice(b"\x01\x06\0\x01\0\0\0\0");
        expect.extend_from_slice(b"\x01\x03\0\x01\0\x08\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(*written.borrow(), expect);
    }

    #[test]
    fn responder_writes_hi() {
        let io = responder_io(b"");
        let written = io.written.clone();
        let mut con = ServerConnection::new(Box::new(io), Role::Responder, 1, false).unwrap();
        con.stdout().write_all(b"hi").unwrap();
        con.close().unwrap();

        let mut expect = Vec::new();
        expect.extend_from_slice(b"\x01\x06\0\x01\0\x02\0\x06hi\0\0\0\0\0\0");
        expect.extend_from_slice(b"\x01\x06\0\x01\0\0\0\0");
        expect.extend_from_slice(b"\x01\x03\0\x01\0\x08\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(*written.borrow(), expect);
    }

    #[test]
    fn application_status_reaches_the_end_request() {
        let io = responder_io(b"");
        let written = io.written.clone();
        let mut con = ServerConnection::new(Box::new(io), Role::Responder, 1, false).unwrap();
        assert_eq!(con.application_status(), 0);
        con.set_application_status(7);
        con.close().unwrap();
        let written = written.borrow();
        let end = &written[written.len() - 16..];
        assert_eq!(end, b"\x01\x03\0\x01\0\x08\0\0\0\0\0\x07\0\0\0\0");
    }

    #[test]
    fn authorizer_has_no_input() {
        let mut io = ScriptedIo::new();
        io.feed(&params_record(1, &[(b"REMOTE_USER", b"daniel")]));
        io.feed(&record(Record::PARAMS, 1, b""));
        let mut con = ServerConnection::new(Box::new(io), Role::Authorizer, 1, false).unwrap();
        assert_eq!(con.read_stdin(&mut [0; 8]).unwrap(), 0);
        con.close().unwrap();
    }

    #[test]
    fn filter_must_drain_stdin_before_closing() {
        let mut io = ScriptedIo::new();
        io.feed(&params_record(1, &[(b"SCRIPT_FILENAME", b"/f")]));
        io.feed(&record(Record::PARAMS, 1, b""));
        io.feed(&record(Record::STDIN, 1, b"unconsumed"));
        io.feed(&record(Record::STDIN, 1, b""));
        io.feed(&record(Record::DATA, 1, b""));
        let mut con = ServerConnection::new(Box::new(io), Role::Filter, 1, false).unwrap();
        assert!(matches!(con.close(), Err(Error::FilterInputPending)));

        // after draining stdin the close goes through
        let mut body = Vec::new();
        con.stdin().read_to_end(&mut body).unwrap();
        assert_eq!(body, b"unconsumed");
        assert_eq!(con.reader.stream_type(), StreamType::Data);
        con.close().unwrap();
    }
}
