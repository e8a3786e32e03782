/*! The framed stream buffers: record framing over a raw transport.

Both directions share the record layout but not much else, so reading and
writing are two types. [`StreamReader`] demultiplexes the client-to-server
record sequence of one request into plain bytes: it hides headers and
padding, drops content that belongs to other requests, answers management
records inline and stops at the empty record that terminates its stream.
[`StreamWriter`] multiplexes plain bytes into records: it frames the put
area in place around a reserved header slot and emits the stream terminator
and end-request records when the connection closes.

Neither type owns the transport. The connection lends it for the duration
of a single fill, flush or close.
*/
use std::cmp;

use bytes::BytesMut;
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::fastcgi::{
    padding_for, put_pair, EndRequestBody, Header, NameValuePair, Record, Role, StreamType,
    UnknownTypeBody, MAX_CONNS, MAX_REQS, MPXS_CONNS,
};
use crate::transport::Transport;

/// Buffer size of the reader of a connection.
pub(crate) const READER_BUFFER_SIZE: usize = 16384;

/// Buffer size of each writer of a connection.
pub(crate) const WRITER_BUFFER_SIZE: usize = 65528;

const MIN_BUFFER_SIZE: usize = 2048;
const MAX_BUFFER_SIZE: usize = 65528;

fn check_buffer_size(size: usize) -> Result<()> {
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) {
        return Err(Error::InvalidArgument("stream buffer size out of range"));
    }
    if size % 8 != 0 {
        return Err(Error::InvalidArgument("stream buffer size must be a multiple of 8"));
    }
    Ok(())
}

/// Demultiplexes the records of one request into the bytes of one stream.
///
/// The reader serves `Params`, then `In` for responders and filters, then
/// `Data` for filters, reusing the same backing buffer across the resets.
pub(crate) struct StreamReader {
    rtype: StreamType,
    buf: Vec<u8>,
    /// Next unconsumed byte.
    pos: usize,
    /// End of the content region the caller may consume.
    avail_end: usize,
    /// End of the bytes obtained by the last refill.
    data_end: usize,
    unread_content: usize,
    unread_padding: usize,
    discard_content: bool,
    end_of_stream: bool,
    closed: bool,
}

impl StreamReader {
    pub(crate) fn new(rtype: StreamType, size: usize) -> Result<StreamReader> {
        debug_assert!(matches!(
            rtype,
            StreamType::Params | StreamType::In | StreamType::Data
        ));
        check_buffer_size(size)?;
        Ok(StreamReader {
            rtype,
            buf: vec![0; size],
            pos: 0,
            avail_end: 0,
            data_end: 0,
            unread_content: 0,
            unread_padding: 0,
            discard_content: false,
            end_of_stream: false,
            closed: false,
        })
    }

    pub(crate) fn stream_type(&self) -> StreamType {
        self.rtype
    }

    pub(crate) fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Marks the reader unusable. Purely local, nothing is transmitted.
    pub(crate) fn close(&mut self) {
        self.pos = 0;
        self.avail_end = 0;
        self.data_end = 0;
        self.closed = true;
    }

    /// Rewinds the stream state to read records of `rtype` next.
    ///
    /// Bytes already buffered stay buffered; they may well contain the
    /// records of the new stream.
    pub(crate) fn reset(&mut self, rtype: StreamType) {
        debug_assert!(!self.closed);
        self.rtype = rtype;
        self.end_of_stream = false;
        self.discard_content = false;
        self.unread_content = 0;
        self.unread_padding = 0;
        debug_assert!(self.invariant_ok());
    }

    /// Replaces the backing buffer.
    pub(crate) fn set_buffer_size(&mut self, size: usize) -> Result<()> {
        check_buffer_size(size)?;
        if self.pos < self.data_end || self.unread_content > 0 || self.unread_padding > 0 {
            return Err(Error::InvalidArgument("cannot replace buffer, data is pending"));
        }
        self.buf = vec![0; size];
        self.pos = 0;
        self.avail_end = 0;
        self.data_end = 0;
        Ok(())
    }

    /// The content bytes ready for the caller.
    pub(crate) fn available(&self) -> &[u8] {
        &self.buf[self.pos..self.avail_end]
    }

    pub(crate) fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.avail_end - self.pos);
        self.pos += count;
    }

    /// Reads into `dst`, filling first if nothing is available. `Ok(0)`
    /// means end of stream.
    pub(crate) fn read(
        &mut self,
        io: &mut dyn Transport,
        request_id: u16,
        role: Role,
        dst: &mut [u8],
    ) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        if !self.fill(io, request_id, role)? {
            return Ok(0);
        }
        let avail = self.available();
        let count = cmp::min(avail.len(), dst.len());
        dst[..count].copy_from_slice(&avail[..count]);
        self.consume(count);
        Ok(count)
    }

    /// Makes content available, walking records until some turns up.
    ///
    /// Returns `Ok(false)` at end of stream. For a filter whose `In` stream
    /// just ended, the reader resets itself to `Data` before returning, so
    /// the next call serves the data stream.
    pub(crate) fn fill(
        &mut self,
        io: &mut dyn Transport,
        request_id: u16,
        role: Role,
    ) -> Result<bool> {
        if self.closed {
            return Err(Error::InvalidArgument("stream is closed"));
        }
        if self.pos < self.avail_end {
            return Ok(true);
        }
        if self.end_of_stream {
            return Ok(false);
        }

        let mut raw = [0u8; Header::LEN];
        let mut raw_len = 0usize;
        loop {
            if self.pos == self.data_end {
                self.refill(io)?;
            }

            // Content of the current record.
            if self.unread_content > 0 {
                let count = cmp::min(self.unread_content, self.data_end - self.pos);
                self.unread_content -= count;
                if !self.discard_content {
                    self.avail_end = self.pos + count;
                    debug_assert!(self.invariant_ok());
                    return Ok(true);
                }
                self.pos += count; // discarding
                if self.unread_content > 0 {
                    continue;
                }
                self.discard_content = false;
            }

            // Padding after the content.
            if self.unread_padding > 0 {
                let count = cmp::min(self.unread_padding, self.data_end - self.pos);
                self.unread_padding -= count;
                self.pos += count; // skipping
                if self.unread_padding > 0 {
                    continue;
                }
            }

            // Accumulating the next header, possibly across refills.
            let count = cmp::min(Header::LEN - raw_len, self.data_end - self.pos);
            raw[raw_len..raw_len + count].copy_from_slice(&self.buf[self.pos..self.pos + count]);
            raw_len += count;
            self.pos += count;
            self.avail_end = self.pos;
            if raw_len < Header::LEN {
                continue;
            }
            raw_len = 0;

            let header = Header::parse(&raw)?;
            self.unread_content = header.content_length as usize;
            self.unread_padding = header.padding_length as usize;

            if header.rtype == Record::BEGIN_REQUEST {
                // One request at a time per connection. Reject the newcomer,
                // keep serving the current request.
                debug!("rejecting begin_request for #{}", header.request_id);
                io.write_all(&EndRequestBody::record(
                    header.request_id,
                    0,
                    EndRequestBody::CANT_MPX_CONN,
                ))?;
                self.discard_content = self.unread_content > 0;
                continue;
            }
            if header.is_management() {
                self.process_management(io, &header)?;
                continue;
            }
            if header.request_id != request_id {
                self.discard_content = self.unread_content > 0;
                continue;
            }
            if header.rtype == self.rtype.code() {
                if self.unread_content > 0 {
                    continue;
                }
                // Empty record of our own type: the stream is over.
                self.end_of_stream = true;
                if role == Role::Filter && self.rtype == StreamType::In {
                    self.reset(StreamType::Data);
                }
                debug_assert!(self.invariant_ok());
                return Ok(false);
            }
            io.write_all(&EndRequestBody::record(
                header.request_id,
                0,
                EndRequestBody::CANT_MPX_CONN,
            ))?;
            return Err(Error::protocol("unexpected record type"));
        }
    }

    /// Exactly one transport read per refill.
    fn refill(&mut self, io: &mut dyn Transport) -> Result<()> {
        debug_assert!(self.pos == self.data_end);
        let count = io.read(&mut self.buf)?;
        if count == 0 {
            return Err(Error::protocol("peer closed the connection mid-record"));
        }
        trace!("{:?} refill: {} bytes", self.rtype, count);
        self.pos = 0;
        self.avail_end = 0;
        self.data_end = count;
        Ok(())
    }

    /// Answers a management record in place.
    ///
    /// get_values is answered with the known variables; anything else with
    /// an unknown-type record. The embedded name-value stream is bounded by
    /// the record content, consumed here in full.
    fn process_management(&mut self, io: &mut dyn Transport, header: &Header) -> Result<()> {
        if header.rtype != Record::GET_VALUES {
            debug!("unknown management record type {}", header.rtype);
            io.write_all(&UnknownTypeBody::record(header.rtype))?;
            return Ok(());
        }

        let mut query = BytesMut::with_capacity(self.unread_content);
        while self.unread_content > 0 {
            if self.pos == self.data_end {
                self.refill(io)?;
            }
            let count = cmp::min(self.unread_content, self.data_end - self.pos);
            query.extend_from_slice(&self.buf[self.pos..self.pos + count]);
            self.pos += count;
            self.unread_content -= count;
        }
        let variables = NameValuePair::pairs_from(query.freeze(), 3)?;

        let mut body = BytesMut::with_capacity(64);
        for variable in &variables {
            let value: &[u8] = if variable.name == MAX_CONNS {
                b"1"
            } else if variable.name == MAX_REQS {
                b"1"
            } else if variable.name == MPXS_CONNS {
                b"0"
            } else {
                // Other variables specified in the get-values record are
                // ignored.
                continue;
            };
            put_pair(&mut body, &variable.name, value);
        }

        let content_length = body.len();
        let total = Header::LEN + content_length + padding_for(content_length);
        let mut reply = BytesMut::zeroed(total);
        Header::new(
            Record::GET_VALUES_RESULT,
            Record::MGMT_REQUEST_ID,
            content_length as u16,
        )
        .write_to(&mut reply[..Header::LEN]);
        reply[Header::LEN..Header::LEN + content_length].copy_from_slice(&body);
        io.write_all(&reply)?;
        debug!("answered get_values, {} bytes", total);
        Ok(())
    }

    fn invariant_ok(&self) -> bool {
        self.pos <= self.avail_end
            && self.avail_end <= self.data_end
            && self.data_end <= self.buf.len()
            && self.unread_content <= Header::MAX_CONTENT_LENGTH
            && self.unread_padding <= Header::MAX_PADDING_LENGTH
            && matches!(
                self.rtype,
                StreamType::Params | StreamType::In | StreamType::Data
            )
    }
}

/// Multiplexes the bytes of one output stream into records.
///
/// Buffer layout: an 8 byte header slot, the put area, and one overshoot
/// byte at the very end so the full-buffer check stays a single compare.
/// Each completed record leaves in exactly one transport write.
pub(crate) struct StreamWriter {
    wtype: StreamType,
    buf: Vec<u8>,
    /// Next free byte of the put area; base is `Header::LEN`.
    put_pos: usize,
    ever_sent: bool,
    end_of_stream: bool,
    closed: bool,
}

impl StreamWriter {
    pub(crate) fn new(wtype: StreamType, size: usize) -> Result<StreamWriter> {
        debug_assert!(matches!(wtype, StreamType::Out | StreamType::Err));
        check_buffer_size(size)?;
        Ok(StreamWriter {
            wtype,
            buf: vec![0; size],
            put_pos: Header::LEN,
            ever_sent: false,
            end_of_stream: false,
            closed: false,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Replaces the backing buffer.
    pub(crate) fn set_buffer_size(&mut self, size: usize) -> Result<()> {
        check_buffer_size(size)?;
        if self.put_pos != Header::LEN {
            return Err(Error::InvalidArgument("cannot replace buffer, data is pending"));
        }
        self.buf = vec![0; size];
        Ok(())
    }

    /// Appends all of `data` to the stream, framing full records as the put
    /// area fills.
    pub(crate) fn write(
        &mut self,
        io: &mut dyn Transport,
        request_id: u16,
        mut data: &[u8],
    ) -> Result<()> {
        if self.closed || self.end_of_stream {
            return Err(Error::InvalidArgument("stream is closed"));
        }
        while !data.is_empty() {
            let put_end = self.buf.len() - 1;
            if self.put_pos < put_end {
                let count = cmp::min(put_end - self.put_pos, data.len());
                self.buf[self.put_pos..self.put_pos + count].copy_from_slice(&data[..count]);
                self.put_pos += count;
                data = &data[count..];
            } else {
                // Put area full. The overshoot slot takes one more byte,
                // then the record goes out.
                self.buf[put_end] = data[0];
                self.put_pos += 1;
                data = &data[1..];
                self.flush_record(io, request_id)?;
            }
        }
        Ok(())
    }

    /// Sends the put area as one record. Empty put area, no record.
    pub(crate) fn flush(&mut self, io: &mut dyn Transport, request_id: u16) -> Result<()> {
        if self.closed || self.end_of_stream {
            return Err(Error::InvalidArgument("stream is closed"));
        }
        self.flush_record(io, request_id)
    }

    fn flush_record(&mut self, io: &mut dyn Transport, request_id: u16) -> Result<()> {
        let content_length = self.put_pos - Header::LEN;
        if content_length > 0 {
            // Zero padding up to the alignment boundary, header into the
            // reserved slot, record out in a single write.
            let padding = padding_for(content_length);
            debug_assert!(self.put_pos + padding <= self.buf.len());
            self.buf[self.put_pos..self.put_pos + padding].fill(0);
            Header::with_padding(
                self.wtype.code(),
                request_id,
                content_length as u16,
                padding as u8,
            )
            .write_to(&mut self.buf[..Header::LEN]);
            io.write_all(&self.buf[..Header::LEN + content_length + padding])?;
            trace!(
                "{:?} record out: {} content, {} padding",
                self.wtype,
                content_length,
                padding
            );
            self.ever_sent = true;
        }
        self.put_pos = Header::LEN;
        Ok(())
    }

    /// Flushes what is pending, then transmits the end records.
    ///
    /// Every stream except an untouched stderr announces its end with an
    /// empty record of its type. `app_status` is given for the `Out` stream
    /// only, which additionally appends the end-request record; the caller
    /// guarantees `Out` closes last.
    pub(crate) fn finish(
        &mut self,
        io: &mut dyn Transport,
        request_id: u16,
        app_status: Option<u32>,
    ) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.end_of_stream {
            self.flush_record(io, request_id)?;

            let mut size = 0usize;
            if self.wtype != StreamType::Err || self.ever_sent {
                Header::with_padding(self.wtype.code(), request_id, 0, 0)
                    .write_to(&mut self.buf[..Header::LEN]);
                size += Header::LEN;
            }
            if let Some(status) = app_status {
                let record =
                    EndRequestBody::record(request_id, status, EndRequestBody::REQUEST_COMPLETE);
                self.buf[size..size + record.len()].copy_from_slice(&record);
                size += record.len();
            }
            if size > 0 {
                io.write_all(&self.buf[..size])?;
                debug!("{:?} end records out: {} bytes", self.wtype, size);
            }
            self.end_of_stream = true;
        }
        Ok(())
    }

    /// Marks the writer unusable.
    pub(crate) fn close(&mut self) {
        debug_assert!(self.end_of_stream);
        self.closed = true;
    }
}
