/*! Server-side FastCGI 1.0 over blocking stream transports.

A FastCGI application accepts requests from an HTTP front-end (nginx,
Apache, ...) over a TCP or Unix socket connection and answers with content,
diagnostic text and an application status. This crate implements the
application side of the protocol with plain blocking I/O:

- record framing and the `Params` name-value codec,
- the per-connection stream buffers that demultiplex request input and
  multiplex response output with minimal copying,
- inline handling of management queries (`FCGI_GET_VALUES`),
- a listener that validates the opening handshake and hands out
  [`ServerConnection`]s.

One connection carries one request; concurrent requests on a single
connection are rejected with `CANT_MPX_CONN`, and the connection is closed
after the response.

```no_run
use std::io::Write;
use blocking_fcgi::{Listener, ListenerOptions, CRLFCRLF};

fn main() -> blocking_fcgi::Result<()> {
    let mut server = Listener::new(ListenerOptions::tcp("0.0.0.0", 9000, 64)?);
    server.listen()?;
    loop {
        let mut conn = server.accept()?;
        let mut out = conn.stdout();
        out.write_all(b"Content-Type: text/plain")?;
        out.write_all(CRLFCRLF)?;
        out.write_all(b"Hello from blocking-fcgi!")?;
        conn.close()?;
    }
}
```

Multiple worker threads may share one listener behind a mutex or accept on
clones of the bound socket; each accepted connection must then be driven by
a single thread.
*/

mod error;
pub mod fastcgi;
mod listener;
mod server;
mod stream;
mod transport;

pub use error::{Error, Result};
pub use fastcgi::{NameValuePair, Role, StreamType};
pub use listener::{Endpoint, Listener, ListenerOptions};
pub use server::{Parameters, ServerConnection, Stderr, Stdin, Stdout, CRLF, CRLFCRLF};
pub use transport::Transport;
