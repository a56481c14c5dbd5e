#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use pg_copy_out::PgConnection;

/// Builds backend message frames the way a server would put them on the wire
pub struct MockBackend {
    buf: BytesMut,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    fn frame(mut self, tag: u8, body: &[u8]) -> Self {
        self.buf.put_u8(tag);
        self.buf.put_i32(body.len() as i32 + 4); // length includes itself
        self.buf.put_slice(body);
        self
    }

    /// Build a CopyOutResponse with `columns` text-format columns
    pub fn copy_out_response(self, columns: u16) -> Self {
        let mut body = BytesMut::new();
        body.put_u8(0); // overall format: text
        body.put_u16(columns);
        for _ in 0..columns {
            body.put_u16(0);
        }
        self.frame(b'H', &body)
    }

    pub fn copy_data(self, data: &[u8]) -> Self {
        self.frame(b'd', data)
    }

    pub fn copy_done(self) -> Self {
        self.frame(b'c', &[])
    }

    pub fn command_complete(self, tag: &str) -> Self {
        let mut body = BytesMut::new();
        body.put_slice(tag.as_bytes());
        body.put_u8(0);
        self.frame(b'C', &body)
    }

    /// `status` is `b'I'`, `b'T'` or `b'E'`
    pub fn ready_for_query(self, status: u8) -> Self {
        self.frame(b'Z', &[status])
    }

    /// Build an ErrorResponse from (field code, value) pairs
    pub fn error_response(self, fields: &[(u8, &str)]) -> Self {
        let body = Self::fields(fields);
        self.frame(b'E', &body)
    }

    pub fn notice_response(self, fields: &[(u8, &str)]) -> Self {
        let body = Self::fields(fields);
        self.frame(b'N', &body)
    }

    pub fn parameter_status(self, name: &str, value: &str) -> Self {
        let mut body = BytesMut::new();
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
        self.frame(b'S', &body)
    }

    pub fn notification(self, pid: i32, channel: &str, payload: &str) -> Self {
        let mut body = BytesMut::new();
        body.put_i32(pid);
        body.put_slice(channel.as_bytes());
        body.put_u8(0);
        body.put_slice(payload.as_bytes());
        body.put_u8(0);
        self.frame(b'A', &body)
    }

    /// A tag the client has never heard of
    pub fn unknown(self, tag: u8, body: &[u8]) -> Self {
        self.frame(tag, body)
    }

    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }

    fn fields(fields: &[(u8, &str)]) -> BytesMut {
        let mut body = BytesMut::new();
        for (code, value) in fields {
            body.put_u8(*code);
            body.put_slice(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0); // terminator
        body
    }
}

/// Connects a `PgConnection` to an in-memory server end, with the
/// parameters a server reports during startup already recorded.
pub fn connect() -> (PgConnection<DuplexStream>, DuplexStream) {
    let (client, server) = duplex(64 * 1024);
    let mut conn = PgConnection::new(client);
    conn.set_parameter("client_encoding", "UTF8").unwrap();
    conn.set_parameter("standard_conforming_strings", "on").unwrap();
    (conn, server)
}

/// Reads one frontend Query message and returns its SQL text.
pub async fn read_query(server: &mut DuplexStream) -> String {
    let tag = server.read_u8().await.unwrap();
    assert_eq!(tag, b'Q', "expected a Query message");
    let len = server.read_i32().await.unwrap() as usize;
    let mut body = vec![0u8; len - 4];
    server.read_exact(&mut body).await.unwrap();
    assert_eq!(body.pop(), Some(0));
    String::from_utf8(body).unwrap()
}

/// Plays the server side: waits for the query, then writes `response`
/// in pieces of `chunk` bytes.
pub async fn serve(mut server: DuplexStream, response: Bytes, chunk: usize) -> (String, DuplexStream) {
    let sql = read_query(&mut server).await;
    for piece in response.chunks(chunk) {
        server.write_all(piece).await.unwrap();
        tokio::task::yield_now().await;
    }
    (sql, server)
}
