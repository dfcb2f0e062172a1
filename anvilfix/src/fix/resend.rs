use crate::fix::checksum::AsyncChecksumWriter;
use crate::fix::decode::ParsedPeek;
use crate::fix::encode::{SerializedInt, SOH, TIME_FORMAT};
use crate::fix::SessionError;
use anyhow::Result;
use chrono::offset::Utc;
use std::str;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Rebuilds a stored frame for retransmission: `PossDupFlag(43)=Y` spliced
/// in after the fixed header, a fresh `SendingTime(52)`, the original
/// sending time preserved in `OrigSendingTime(122)`, and `BodyLength(9)`
/// and `CheckSum(10)` recomputed.
pub(super) struct Transformer {
    msg: Vec<u8>,
    len_start: usize,
    len_end: usize,
    sending_time_start: usize,
    sending_time_end: usize,
    fixed_fields_end: usize,
    msg_type: Vec<u8>,
}

const POSS_DUP_FLAG_EQ_Y: &[u8] = b"43=Y\x01";
const ORIG_SENDING_TIME_TAG: &[u8] = b"122=";

impl Transformer {
    pub(super) fn msg_type(&self) -> &[u8] {
        &self.msg_type
    }

    fn original_sending_time(&self) -> &[u8] {
        &self.msg[self.sending_time_start..self.sending_time_end]
    }

    pub(super) async fn build_async<W>(self, sink: W) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut writer = AsyncChecksumWriter::new(sink);

        let len_bytes = &self.msg[self.len_start..self.len_end];
        let old_len: u32 = str::from_utf8(len_bytes)
            .or(Err(SessionError::ResendError))?
            .parse()
            .or(Err(SessionError::ResendError))?;

        let orig_sending_time: &[u8] = self.original_sending_time();
        let new_sending_time = format!("{}", Utc::now().format(TIME_FORMAT));

        // The replaced SendingTime value and the added OrigSendingTime value
        // cancel out, so the length delta is independent of the original
        // timestamp's width.
        let new_len = old_len
            + new_sending_time.len() as u32
            + POSS_DUP_FLAG_EQ_Y.len() as u32
            + ORIG_SENDING_TIME_TAG.len() as u32
            + 1;
        let new_len_bytes = SerializedInt::from(new_len);

        writer.write_all(&self.msg[..self.len_start]).await?;
        writer.write_all(new_len_bytes.as_bytes()).await?;
        writer.write_all(SOH).await?;
        writer
            .write_all(&self.msg[self.len_end + 1..self.fixed_fields_end])
            .await?;
        writer.write_all(POSS_DUP_FLAG_EQ_Y).await?;
        writer
            .write_all(&self.msg[self.fixed_fields_end..self.sending_time_start])
            .await?;
        writer.write_all(new_sending_time.as_bytes()).await?;
        writer.write_all(SOH).await?;
        writer.write_all(ORIG_SENDING_TIME_TAG).await?;
        writer.write_all(orig_sending_time).await?;
        writer.write_all(SOH).await?;
        writer
            .write_all(&self.msg[self.sending_time_end + 1..self.msg.len() - 7])
            .await?;
        let checksum_str = format!("{:0>3}", writer.checksum());
        writer.write_all(b"10=").await?;
        writer.write_all(checksum_str.as_bytes()).await?;
        writer.write_all(SOH).await?;
        Ok(())
    }
}

impl TryFrom<Vec<u8>> for Transformer {
    type Error = crate::fix::SessionError;

    fn try_from(msg: Vec<u8>) -> Result<Transformer, SessionError> {
        let ParsedPeek {
            msg_type,
            len_start,
            len_end,
            fixed_fields_end,
            ..
        } = crate::fix::decode::parse_peeked_prefix(&msg[..std::cmp::min(32, msg.len())])?;
        let (sending_time_start, sending_time_end) =
            sending_time_indices(&msg).ok_or(SessionError::ResendError)?;
        Ok(Transformer {
            msg,
            msg_type,
            len_start,
            len_end,
            sending_time_start,
            sending_time_end,
            fixed_fields_end,
        })
    }
}

fn sending_time_indices(msg: &[u8]) -> Option<(usize, usize)> {
    let mut start: usize = 0;
    let mut found_start = false;
    for (i, b) in msg.iter().enumerate().skip(4) {
        if !found_start && &msg[(i - 4)..i] == b"\x0152=" {
            found_start = true;
            start = i;
        }
        if found_start && b == &b'\x01' {
            return Some((start, i));
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::checksum::{calc_checksum, checksum_is_valid};
    use crate::fix::decode;

    fn frame(body: &str) -> Vec<u8> {
        let mut v = format!("8=FIX.4.4\x019={}\x01{}", body.len(), body).into_bytes();
        let cs = calc_checksum(&v);
        v.extend_from_slice(format!("10={:03}\x01", cs).as_bytes());
        v
    }

    async fn transform(orig: Vec<u8>) -> Vec<u8> {
        let t: Transformer = orig.try_into().unwrap();
        let mut buf = Vec::new();
        let mut cur = tokio::io::BufWriter::new(&mut buf);
        t.build_async(&mut cur).await.expect("building");
        cur.flush().await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_transformer_self_consistent() {
        let orig = frame(
            "35=D\x0134=2\x0149=Client\x0152=20240506-13:59:15.021\x0156=Server\x0111=order-123\x0155=IBM\x01",
        );
        let out = transform(orig).await;

        let text = String::from_utf8_lossy(&out).into_owned();
        assert!(text.contains("43=Y\x01"));
        assert!(text.contains("122=20240506-13:59:15.021\x01"));
        assert!(text.contains("11=order-123\x01"));
        assert!(checksum_is_valid(&out));
        let peek = decode::parse_peeked_prefix(&out[..32]).unwrap();
        assert_eq!(peek.msg_length, out.len());
    }

    #[tokio::test]
    async fn test_transformer_short_original_timestamp() {
        // originals stored without millisecond precision still transform to
        // a self-consistent frame
        let orig = frame(
            "35=D\x0134=3\x0149=Client\x0152=20240506-13:59:15\x0156=Server\x0111=order-124\x01",
        );
        let out = transform(orig).await;
        assert!(checksum_is_valid(&out));
        let peek = decode::parse_peeked_prefix(&out[..32]).unwrap();
        assert_eq!(peek.msg_length, out.len());
        assert!(String::from_utf8_lossy(&out).contains("122=20240506-13:59:15\x01"));
    }

    #[tokio::test]
    async fn test_transformer_rejects_frame_without_sending_time() {
        let orig = frame("35=D\x0134=2\x0149=Client\x0156=Server\x0111=order-123\x01");
        assert!(matches!(
            Transformer::try_from(orig),
            Err(SessionError::ResendError)
        ));
    }

    #[test]
    fn test_poss_dup_splice_constants() {
        assert_eq!(POSS_DUP_FLAG_EQ_Y.len(), 5);
        assert_eq!(ORIG_SENDING_TIME_TAG.len(), 4);
    }
}
