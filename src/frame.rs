use byteorder::{ByteOrder, LittleEndian};

/// If the bit-and of a handle and this value equals 0,
/// the enclosed payload is a method call pushed by the server.
/// Otherwise it is the response to a call made by this client.
pub(crate) const RESPONSE_MASK: u32 = 0x8000_0000;

/// Client handles wrap back to `RESPONSE_MASK` before reaching this value.
const HANDLE_CEILING: u32 = 0xffff_ff00;

/// Largest allowed outbound frame, counting the 8 prefix bytes.
pub(crate) const MAX_REQUEST_SIZE: usize = 4 * 1024 * 1024;

/// Prefix `body` with its length and the call handle.
///
/// The length field counts the handle and the body, but not itself.
pub(crate) fn encode_request(handle: u32, body: &[u8]) -> Vec<u8> {
    let mut length_bytes = [0; 4];
    LittleEndian::write_u32(&mut length_bytes, body.len() as u32 + 4);

    let mut handle_bytes = [0; 4];
    LittleEndian::write_u32(&mut handle_bytes, handle);

    [&length_bytes[..], &handle_bytes[..], body].concat()
}

/// A complete message cut out of the byte stream.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Frame {
    /// The banner the server sends right after the TCP connect,
    /// framed without a handle.
    Handshake(Vec<u8>),

    /// Every message after the banner: a call handle and an XML payload.
    Message { handle: u32, body: Vec<u8> },
}

/// Cuts frames out of an arbitrarily chunked byte stream.
///
/// The server's length prefix counts only the payload, so once the
/// handshake is done, four handle bytes are added to the number of
/// bytes to wait for. The handshake banner itself carries no handle.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    recv_buf: Vec<u8>,
    expected_len: Option<usize>,
    past_handshake: bool,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.recv_buf.extend_from_slice(bytes);
    }

    /// Cut the next complete frame out of the buffer.
    ///
    /// Call in a loop until it returns `None`: one read may complete
    /// several frames, or none at all.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.expected_len.is_none() && self.recv_buf.len() >= 4 {
            let declared = LittleEndian::read_u32(&self.recv_buf) as usize;
            self.recv_buf.drain(..4);
            self.expected_len = if self.past_handshake {
                Some(declared + 4)
            } else {
                Some(declared)
            };
        }

        let expected = self.expected_len?;
        if self.recv_buf.len() < expected {
            return None;
        }

        let frame: Vec<u8> = self.recv_buf.drain(..expected).collect();
        self.expected_len = None;

        if !self.past_handshake {
            self.past_handshake = true;
            return Some(Frame::Handshake(frame));
        }

        Some(Frame::Message {
            handle: LittleEndian::read_u32(&frame),
            body: frame[4..].to_vec(),
        })
    }
}

/// Mints the handles that match responses back to callers.
///
/// Handles live in `[0x8000_0000, 0xffff_ff00)`; the high bit tells
/// them apart from the handles of server-initiated calls.
#[derive(Debug)]
pub(crate) struct HandleAllocator {
    prev_handle: u32,
}

impl HandleAllocator {
    pub fn new() -> HandleAllocator {
        HandleAllocator {
            prev_handle: RESPONSE_MASK,
        }
    }

    pub fn next_handle(&mut self) -> u32 {
        self.prev_handle += 1;
        if self.prev_handle >= HANDLE_CEILING {
            self.prev_handle = RESPONSE_MASK;
        }
        self.prev_handle
    }
}
