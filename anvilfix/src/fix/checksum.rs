use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

pub struct ChecksumWriter<W>(W, usize);
impl<W> Write for ChecksumWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for c in buf {
            self.1 += (*c) as usize;
        }
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}
impl<W> ChecksumWriter<W> {
    #[allow(dead_code)]
    pub fn new(w: W) -> Self {
        ChecksumWriter(w, 0)
    }
    #[allow(dead_code)]
    pub fn checksum(&self) -> usize {
        self.1 % 256
    }
}

pub struct AsyncChecksumWriter<W>(W, usize);
impl<W> AsyncWrite for AsyncChecksumWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let mut_self = &mut self.get_mut();
        for c in buf {
            mut_self.1 += (*c) as usize;
        }

        Pin::new(&mut mut_self.0).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }
    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}
impl<W> AsyncChecksumWriter<W> {
    pub fn new(w: W) -> Self {
        AsyncChecksumWriter(w, 0)
    }
    pub fn checksum(&self) -> usize {
        self.1 % 256
    }
}

pub fn calc_checksum(bytes: &[u8]) -> i32 {
    bytes.iter().map(|c| *c as i32).sum::<i32>() % 256
}

// The trailer is always 10=xxx| which is 7 bytes. CheckSum(10) covers every
// byte of the message before the trailer itself.
pub fn checksum_is_valid(msg_buf: &[u8]) -> bool {
    if let Some(checksum) = parse_checksum(msg_buf) {
        return checksum_matches(&msg_buf[..msg_buf.len() - 7], checksum);
    }
    false
}

fn parse_checksum(msg_buf: &[u8]) -> Option<i32> {
    if msg_buf.len() < 7 {
        return None;
    }
    let tail = &msg_buf[msg_buf.len() - 7..];
    if &tail[0..3] != b"10="
        || !tail[3..6].iter().all(|&byte| byte.is_ascii_digit())
        || tail[6] != b'\x01'
    {
        return None;
    }

    match std::str::from_utf8(&tail[3..6]).unwrap_or("").parse() {
        Ok(v) => Some(v),
        _ => None,
    }
}

fn checksum_matches(msg: &[u8], checksum: i32) -> bool {
    let calculated = calc_checksum(msg);
    checksum == calculated
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(body: &str) -> Vec<u8> {
        let mut v = format!("8=FIX.4.4\x019={}\x01{}", body.len(), body).into_bytes();
        let cs = calc_checksum(&v);
        v.extend_from_slice(format!("10={:03}\x01", cs).as_bytes());
        v
    }

    #[test]
    fn test_checksum_round_trip() {
        let bodies = [
            "35=0\x0134=2\x0149=Client\x0152=20240506-13:59:15.021\x0156=Server\x01",
            "35=5\x0134=4\x0149=Server\x0152=20240506-13:59:15.021\x0156=Client\x0158=bye\x01",
        ];
        for body in bodies {
            let f = frame(body);
            assert!(checksum_is_valid(&f), "{:?}", f);
            let mut corrupted = f.clone();
            corrupted[12] ^= 0x20;
            assert!(!checksum_is_valid(&corrupted));
        }
    }

    #[test]
    fn test_checksum_writer_matches_calc() {
        let data = frame("35=A\x0134=1\x0149=A\x0156=B\x0198=0\x01108=30\x01");
        let mut sink: Vec<u8> = Vec::new();
        let cur = std::io::Cursor::new(&mut sink);
        let mut cw = ChecksumWriter::new(cur);
        cw.write_all(&data[..data.len() - 7]).expect("writing");
        assert_eq!(cw.checksum() as i32, calc_checksum(&data[..data.len() - 7]));
    }

    #[test]
    fn test_parse_checksum() {
        let tests: Vec<(&[u8], bool)> = vec![
            (b"aaaaaaaaaaaaaaaa10=123\x01", true),
            (b"aaaaaaaa10=43\x01", false),
            (b"aaaaaaaa10=123", false),
            (b"aaaaaaaa11=123\x01", false),
            (b"10=1\x01", false),
        ];
        for t in tests {
            assert_eq!(
                parse_checksum(t.0).is_some(),
                t.1,
                "{:?} {}",
                parse_checksum(t.0),
                t.1
            );
        }
    }
}
