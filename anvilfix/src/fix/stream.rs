use crate::fix::decode;
use crate::fix::log::{LogLevel, Logger};
use crate::fix::mem::MsgBuf;
use crate::fix::{validate, SessionError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Enough of a frame to cover `8=FIX.4.4|9=<len>|35=<type>|` for any legal
/// length under the frame cap.
pub(super) const PEEK_LEN: usize = 32;

pub(super) trait TryRead {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error>;
}

impl TryRead for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        <TcpStream>::try_read(self, buf)
    }
}

/// Sliding prefix buffer. The session fills it to `N` bytes, peeks the frame
/// length out of it, then drains the rest of the frame straight off the
/// socket.
pub(super) struct PrefixBuf<const N: usize> {
    inner: Box<[u8]>,
    filled_len: usize,
}

impl<const N: usize> PrefixBuf<N> {
    pub(super) fn new() -> Self {
        PrefixBuf {
            inner: vec![0; N].into_boxed_slice(),
            filled_len: 0,
        }
    }
    fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.inner[self.filled_len..]
    }
    fn advance(&mut self, n: usize) {
        self.filled_len = std::cmp::min(self.filled_len + n, self.inner.len());
    }
    fn clear(&mut self) {
        self.filled_len = 0;
    }
    fn is_full(&self) -> bool {
        self.filled_len == N
    }
    fn filled(&self) -> &[u8] {
        &self.inner[0..self.filled_len]
    }
    // take() is "slow": rotate_left(n) is O(N) and it allocates. Only for
    // events assumed rare, such as receiving a garbled message.
    fn take(&mut self, n: usize) -> Vec<u8> {
        let n = std::cmp::min(n, self.filled_len);
        let taken = self.inner[..n].to_vec();
        self.inner.rotate_left(n);
        self.filled_len -= n;
        taken
    }
}

/// Fill the prefix buffer from the socket. Cancellation-safe: a partial fill
/// survives in `buf` across `select!` rounds.
pub(super) async fn read_prefix<R: AsyncRead + Unpin, const N: usize>(
    r: &mut R,
    buf: &mut PrefixBuf<N>,
) -> Result<(), SessionError> {
    loop {
        // tolerate stray whitespace between frames
        while buf
            .filled()
            .first()
            .map(|b| b.is_ascii_whitespace())
            .unwrap_or(false)
        {
            buf.take(1);
        }
        if buf.is_full() {
            return Ok(());
        }

        let num_read = r.read(buf.unfilled_mut()).await?;
        buf.advance(num_read);

        if num_read == 0 {
            return Err(SessionError::TcpDisconnection);
        }
    }
}

/// Read the rest of the frame whose prefix sits in `prefix`. On a garbled
/// prefix the stream is resynchronized to the next `8=F` boundary and the
/// skipped bytes are surfaced through the logger.
pub(super) async fn read_frame<const N: usize, T>(
    r: &mut T,
    prefix: &mut PrefixBuf<N>,
    logger: &dyn Logger,
) -> Result<MsgBuf, SessionError>
where
    T: TryRead + AsyncRead + Unpin,
{
    let total_len = match decode::parse_peeked_prefix(prefix.filled()) {
        Ok(peek) => peek.msg_length,
        Err(e) => {
            let junk = skip_to_next_frame(r, prefix).await?;
            log_junk(logger, &junk);
            return Err(e);
        }
    };

    let prefix_len = prefix.filled().len();
    if total_len < prefix_len {
        let junk = skip_to_next_frame(r, prefix).await?;
        log_junk(logger, &junk);
        return Err(SessionError::new_garbled_message(
            String::from("BodyLength(9) shorter than the fixed header"),
            crate::fix::GarbledMessageType::BodyLengthIssue,
        ));
    }

    let mut msg_vec = vec![0; total_len];
    msg_vec[..prefix_len].copy_from_slice(prefix.filled());
    prefix.clear();
    r.read_exact(&mut msg_vec[prefix_len..]).await?;

    let msg_buf: MsgBuf = msg_vec.into();

    if let Err(e) = validate::validate_msg_length(&msg_buf[..], msg_buf.len()) {
        let junk = skip_to_next_frame(r, prefix).await?;
        log_junk(logger, &junk);
        return Err(e);
    }

    Ok(msg_buf)
}

fn log_junk(logger: &dyn Logger, junk: &[u8]) {
    if !junk.is_empty() && logger.enabled(LogLevel::Warn) {
        logger.log(
            LogLevel::Warn,
            &format!(
                "skipped {} bytes of unframed input: {:?}",
                junk.len(),
                MsgBuf(junk.to_vec())
            ),
        );
    }
}

// Finds the position of the longest, if any, prefix of `target` that is also
// a suffix of `buf` using a simple brute force scan.
//
// Examples: a prefix of "8=F" exists in "xxx8=F", "xxx8=" and "xxx8", but one
// does not exist in "xxx8=x", or "xxxx8x".
fn partial_match_in_suffix(buf: &[u8], target: &[u8]) -> Option<usize> {
    let largest_match_len = std::cmp::min(target.len(), buf.len());
    for prefix_len in (1..=largest_match_len).rev() {
        let suffix_begin = buf.len() - prefix_len;
        if buf[suffix_begin..] == target[..prefix_len] {
            return Some(suffix_begin);
        }
    }
    None
}

// Looks for an exact match of `target` in `buf`, falling back to a prefix of
// `target` in the suffix of `buf`. Brute force is fine here: both inputs are
// small and this never runs on the hot path.
fn position_or_partial_match(buf: &[u8], target: &[u8]) -> Option<usize> {
    buf.windows(target.len())
        .position(|window| window == target)
        .or_else(|| partial_match_in_suffix(buf, target))
}

impl<const N: usize> PrefixBuf<N> {
    fn take_until_possible_match(&mut self, target: &[u8]) -> Vec<u8> {
        self.take(position_or_partial_match(self.filled(), target).unwrap_or(self.filled_len))
    }
}

const FRAME_BEGINNING: &[u8] = b"8=F";

async fn skip_to_next_frame<const N: usize, T>(
    stream: &mut T,
    prefix: &mut PrefixBuf<N>,
) -> Result<Vec<u8>, SessionError>
where
    T: TryRead + AsyncRead + Unpin,
{
    // The current prefix is assumed garbled; drop its first byte so the scan
    // below cannot mistake the garbled frame for the next one.
    let mut sink = prefix.take(1);

    while !prefix.filled().starts_with(FRAME_BEGINNING) {
        sink.extend(prefix.take_until_possible_match(FRAME_BEGINNING));
        match stream.try_read(prefix.unfilled_mut()) {
            Ok(0) => break,
            Ok(n) => prefix.advance(n),
            Err(ref e) if e.kind() == tokio::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(sink)
}

// Graceful FIN close, so frames written just before the disconnect (a final
// Reject/Logout pair, say) still reach the peer.
pub(super) async fn disconnect(mut stream: TcpStream) {
    _ = stream.shutdown().await;
    std::mem::drop(stream);
}

pub(super) async fn send_frame<W: AsyncWrite + Unpin>(
    msg_buf: &MsgBuf,
    w: &mut W,
) -> Result<(), SessionError> {
    w.write_all(&msg_buf[..]).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::BrokenPipe {
            SessionError::TcpDisconnection
        } else {
            e.into()
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::checksum::calc_checksum;
    use crate::fix::log::StdoutLogger;
    use crate::fix::GarbledMessageType;
    use std::io::Cursor;

    impl TryRead for Cursor<&[u8]> {
        fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
            std::io::Read::read(self, buf)
        }
    }

    fn frame(body: &str) -> Vec<u8> {
        let mut v = format!("8=FIX.4.4\x019={}\x01{}", body.len(), body).into_bytes();
        let cs = calc_checksum(&v);
        v.extend_from_slice(format!("10={:03}\x01", cs).as_bytes());
        v
    }

    fn logon_body() -> String {
        "35=A\x0134=1\x0149=ISLD\x0152=20240506-13:59:15.021\x0156=TW\x0198=0\x01108=30\x01141=Y\x01".to_string()
    }

    #[tokio::test]
    async fn test_read_frame() {
        let logger = StdoutLogger::default();
        let data = frame(&logon_body());
        let mut incoming = Cursor::new(data.as_slice());
        let mut prefix = PrefixBuf::<{ PEEK_LEN }>::new();
        assert!(read_prefix(&mut incoming, &mut prefix).await.is_ok());

        let got = read_frame(&mut incoming, &mut prefix, &logger)
            .await
            .unwrap();
        assert_eq!(got.0, data);
    }

    #[tokio::test]
    async fn test_read_frame_bad_begin_string() {
        let logger = StdoutLogger::default();
        let mut data = frame(&logon_body());
        data[6] = b'5'; // FIX.4.4 -> FIX.5.4 in place
        let mut incoming = Cursor::new(data.as_slice());
        let mut prefix = PrefixBuf::<{ PEEK_LEN }>::new();
        assert!(read_prefix(&mut incoming, &mut prefix).await.is_ok());

        assert!(matches!(
            read_frame(&mut incoming, &mut prefix, &logger).await,
            Err(SessionError::GarbledMessage {
                garbled_msg_type: GarbledMessageType::BeginStringIssue,
                ..
            }),
        ));
        // the resync consumed the whole stream looking for the next frame
        assert_eq!(incoming.position() as usize, data.len());
        assert_eq!(prefix.filled(), &[]);
    }

    #[tokio::test]
    async fn test_read_frame_wrong_length() {
        let logger = StdoutLogger::default();
        let body = logon_body();
        // understate the body length: the trailer check lands mid-body
        let mut data = format!("8=FIX.4.4\x019={}\x01{}", body.len() - 13, body).into_bytes();
        data.extend_from_slice(b"10=000\x01");
        let mut incoming = Cursor::new(data.as_slice());
        let mut prefix = PrefixBuf::<{ PEEK_LEN }>::new();
        assert!(read_prefix(&mut incoming, &mut prefix).await.is_ok());

        assert!(matches!(
            read_frame(&mut incoming, &mut prefix, &logger).await,
            Err(SessionError::GarbledMessage {
                garbled_msg_type: GarbledMessageType::BodyLengthIssue,
                ..
            }),
        ));
    }

    #[tokio::test]
    async fn test_whitespace_between_frames_is_skipped() {
        let logger = StdoutLogger::default();
        let mut data = b"\r\n  ".to_vec();
        data.extend(frame(&logon_body()));
        let mut incoming = Cursor::new(data.as_slice());
        let mut prefix = PrefixBuf::<{ PEEK_LEN }>::new();
        read_prefix(&mut incoming, &mut prefix).await.unwrap();
        let got = read_frame(&mut incoming, &mut prefix, &logger)
            .await
            .unwrap();
        assert_eq!(got.0, frame(&logon_body()));
    }

    #[tokio::test]
    async fn test_read_prefix_disconnection() {
        let mut prefix = PrefixBuf::<{ PEEK_LEN }>::new();
        let mut closed = Cursor::new(b"".as_slice());
        assert!(matches!(
            read_prefix(&mut closed, &mut prefix).await.unwrap_err(),
            SessionError::TcpDisconnection,
        ));
    }

    #[tokio::test]
    async fn test_skip_to_next_frame() {
        let mut prefix = PrefixBuf::<{ PEEK_LEN }>::new();

        let data = frame(&logon_body());
        let mut no_next = Cursor::new(data.as_slice());
        read_prefix(&mut no_next, &mut prefix).await.unwrap();
        assert!(skip_to_next_frame(&mut no_next, &mut prefix).await.is_ok());
        assert_eq!(no_next.position() as usize, data.len());
        assert_eq!(prefix.filled(), &[]);

        prefix.clear();
        let mut next_in_prefix = Cursor::new(b"8=FIX.5.2\x01xxxxxxxxxxxxxxxxxxx8=F".as_slice());
        read_prefix(&mut next_in_prefix, &mut prefix).await.unwrap();
        assert!(skip_to_next_frame(&mut next_in_prefix, &mut prefix)
            .await
            .is_ok());
        assert_eq!(
            next_in_prefix.position() as usize,
            next_in_prefix.get_ref().len()
        );
        assert_eq!(prefix.filled(), b"8=F".as_slice());

        prefix.clear();
        let mut partial_tail = Cursor::new(b"8=FIX.5.2\x01xxxxxxxxxxxxxxxxxxxx8=".as_slice());
        read_prefix(&mut partial_tail, &mut prefix).await.unwrap();
        assert!(skip_to_next_frame(&mut partial_tail, &mut prefix)
            .await
            .is_ok());
        assert_eq!(
            partial_tail.position() as usize,
            partial_tail.get_ref().len()
        );
        assert_eq!(prefix.filled(), b"8=".as_slice());
    }

    #[test]
    fn test_prefix_buf() {
        let mut buf = PrefixBuf::<5>::new();
        assert_eq!(buf.unfilled_mut(), vec![0; 5].as_slice());
        assert_eq!(buf.filled(), vec![].as_slice());

        buf.unfilled_mut()[..3].copy_from_slice(vec![1, 2, 3].as_slice());
        buf.advance(3);
        assert_eq!(buf.unfilled_mut(), vec![0; 2].as_slice());
        assert_eq!(buf.filled(), vec![1, 2, 3].as_slice());

        assert_eq!(buf.take(1), vec![1]);
        assert_eq!(buf.unfilled_mut().len(), 3);
        assert_eq!(buf.filled(), vec![2, 3]);

        assert_eq!(buf.take(2), vec![2, 3]);
        assert_eq!(buf.unfilled_mut().len(), 5);
        assert_eq!(buf.filled(), vec![].as_slice());

        buf.unfilled_mut()[..3].copy_from_slice(vec![4, 5, 6].as_slice());
        buf.advance(3);
        assert_eq!(buf.take(100), vec![4, 5, 6]);
        assert_eq!(buf.filled().len(), 0);

        buf.advance(100);
        assert_eq!(buf.filled().len(), 5);
        assert_eq!(buf.unfilled_mut().len(), 0);
    }

    #[test]
    fn test_partial_match() {
        let partial_match_in_suffix_fields: Vec<(&[u8], &[u8], Option<usize>)> = vec![
            (b"xxx8", b"8=F", Some(3)),
            (b"xxx8=", b"8=F", Some(3)),
            (b"xxx8=F", b"8=F", Some(3)),
            (b"xxxxx", b"8=F", None),
            (b"xxx8=x", b"8=F", None),
            (b"x8", b"8=F", Some(1)),
            (b"8", b"8=F", Some(0)),
            (b"", b"8=F", None),
        ];
        for (buf, target, expected) in partial_match_in_suffix_fields {
            assert_eq!(partial_match_in_suffix(buf, target), expected);
        }

        let position_or_partial_match_fields: Vec<(&[u8], &[u8], Option<usize>)> = vec![
            (b"8=F", b"8=F", Some(0)),
            (b"xx8=Fxxx", b"8=F", Some(2)),
            (b"xx8=xxx", b"8=F", None),
            (b"x8", b"8=F", Some(1)),
            (b"", b"8=F", None),
        ];
        for (buf, target, expected) in position_or_partial_match_fields {
            assert_eq!(position_or_partial_match(buf, target), expected);
        }
    }
}
