//! Message building and encoding.
//!
//! Outbound FIX messages are assembled with the [`MessageBuilder`]. The
//! builder takes any number of tag/value pairs; use [`Tags`] for tags and
//! the following for values:
//!
//! * [`MsgType`] for `MsgType(35)`
//! * [field enums] for FIX enumerations
//! * [`SerializedInt`] for integer values
//! * `b"..."` for ASCII fields like text and floats
//!
//! [field enums]: crate::fix::fields
//! [`Tags`]: crate::fix::fields::Tags
//! [`MsgType`]: crate::fix::fields::MsgType
//!
//! ## Example
//! ```rust
//! use anvilfix::fix::encode::{MessageBuilder, SerializedInt};
//! use anvilfix::fix::fields::{self, MsgType, Tags};
//!
//! let builder = MessageBuilder::new("FIX.4.4", MsgType::ORDER_SINGLE.into())
//!     .push(Tags::ClOrdID, b"order-123")
//!     .push(Tags::OrderQty, SerializedInt::from(250u32).as_bytes())
//!     .push(Tags::OrdType, fields::OrdType::MARKET.into())
//!     .push(Tags::Symbol, b"IBM");
//! ```

use crate::fix::checksum::AsyncChecksumWriter;
use crate::fix::fields::Tags;
use chrono::{DateTime, Utc};
use std::io::{Cursor, Write};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// The FIX timestamp format in [chrono format syntax]
///
/// [chrono format syntax]: https://docs.rs/chrono/latest/chrono/format/strftime/index.html
pub const TIME_FORMAT: &str = "%Y%m%d-%H:%M:%S%.3f";

/// Returns the current UTC time in [`TIME_FORMAT`]
pub fn formatted_time() -> String {
    format!("{}", Utc::now().format(TIME_FORMAT))
}

/// A struct for building FIX messages.
///
/// The session fills the envelope in when the message is sent, so **do not
/// add the following**:
///
/// * `BodyLength(9)`
/// * `MsgSeqNum(34)`
/// * `SenderCompID(49)`
/// * `TargetCompID(56)`
/// * `SendingTime(52)`
/// * `CheckSum(10)`
///
/// Builder fields are not checked for validity against a dictionary; it is
/// possible to build an invalid message if a value is wrong for its field.
#[derive(Debug)]
pub struct MessageBuilder {
    preamble: Cursor<[u8; 32]>, // e.g. 8=FIX.4.4^9=_________________
    msg_type: char,
    main_buffer: Cursor<Vec<u8>>,
}

pub(super) const SOH: &[u8] = &[b'\x01'];

impl MessageBuilder {
    /// Creates a new [`MessageBuilder`] with `begin_string` and `msg_type`.
    /// It is helpful to use [`MsgType`] variants for `msg_type`.
    ///
    /// [`MsgType`]: crate::fix::fields::MsgType
    pub fn new(begin_string: &str, msg_type: char) -> Self {
        let mut writer = Cursor::new([0_u8; 32]);
        writer
            .write_fmt(format_args!("8={}\x019=", begin_string))
            .unwrap();
        let main_buffer = Cursor::new(Vec::with_capacity(1024));

        MessageBuilder {
            preamble: writer,
            msg_type,
            main_buffer,
        }
    }

    fn write_bytes(&mut self, buf: &[u8]) -> std::io::Result<()> {
        std::io::Write::write(&mut self.main_buffer, buf).map(|_| ())
    }

    /// Adds a `tag`/`value` pair to the message body. It is helpful to use
    /// [`Tags`] for `tag`.
    ///
    /// [`Tags`]: crate::fix::fields::Tags
    pub fn push(mut self, tag: impl Into<u32>, value: &[u8]) -> Self {
        self.push_mut(tag, value);
        self
    }

    pub fn push_mut(&mut self, tag: impl Into<u32>, value: &[u8]) {
        let tag: u32 = tag.into();
        let _ = self.write_bytes(tag.to_string().as_bytes());
        let _ = self.write_bytes(b"=");
        let _ = self.write_bytes(value);
        let _ = self.write_bytes(SOH);
    }

    fn body_len(&self) -> usize {
        let body_len = self.main_buffer.position() as usize;
        let msg_type_len = 5; // 35=X|
        body_len + msg_type_len
    }

    pub(super) async fn build_async<W>(
        &self,
        sink: W,
        msg_seq_num: u32,
        envelope: &EnvelopeHeaders,
        sending_time: DateTime<Utc>,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut writer = AsyncChecksumWriter::new(sink);
        let body_len = self.body_len();
        let msg_seq_num_str = format!("34={}\x01", msg_seq_num);

        writer
            .write_all(&self.preamble.get_ref()[..self.preamble.position() as usize])
            .await?;
        let body_len_str = (body_len + envelope.len() + msg_seq_num_str.len()).to_string();
        writer.write_all(body_len_str.as_bytes()).await?;
        writer.write_all(SOH).await?;
        let msg_type_str = format!("35={}\x01", self.msg_type);
        writer.write_all(msg_type_str.as_bytes()).await?;
        writer.write_all(msg_seq_num_str.as_bytes()).await?;

        envelope.write_all(&mut writer, sending_time).await?;

        writer.write_all(self.main_buffer.get_ref()).await?;
        let checksum: usize = writer.checksum();
        let checksum_str = format!("{:0>3}", checksum);
        writer.write_all(b"10=").await?;
        writer.write_all(checksum_str.as_bytes()).await?;
        writer.write_all(SOH).await?;
        Ok(())
    }

    /// Gets the `MsgType(35)` of this builder
    pub fn msg_type(&self) -> char {
        self.msg_type
    }
}

/// A [`u64`]/[`u32`] wrapper that can convert an int to its ASCII representation
///
/// ## Example
///
/// ```rust
/// # use anvilfix::fix::encode::SerializedInt;
/// let num = SerializedInt::from(15u32);
/// assert_eq!(num.as_bytes(), b"15");
/// ```
#[derive(Default)]
pub struct SerializedInt([u8; 32], usize);

impl SerializedInt {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[self.0.len() - self.1..]
    }
}
impl From<u32> for SerializedInt {
    fn from(u: u32) -> Self {
        Self::from(u as u64)
    }
}
impl From<u64> for SerializedInt {
    fn from(u: u64) -> Self {
        let mut ser: SerializedInt = Default::default();
        if u == 0 {
            ser.0[ser.0.len() - 1] = b'0';
            ser.1 = 1;
            return ser;
        }
        let mut n = u;
        let mut cursor = 0;
        while n > 0 {
            let quotient = n / 10;
            let remainder = n % 10;
            let at = ser.0.len() - 1 - cursor;
            ser.0[at] = b'0' + remainder as u8;
            n = quotient;
            cursor += 1;
        }
        ser.1 = cursor;
        ser
    }
}

/// The per-session envelope: `SenderCompID(49)` before `SendingTime(52)`,
/// `TargetCompID(56)` after it, matching standard header tag order. Built
/// once the peer CompID is known; acceptor sessions learn it from the first
/// inbound frame.
#[derive(Default, Debug)]
pub(super) struct EnvelopeHeaders {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl EnvelopeHeaders {
    pub fn new(sender_comp_id: &str, target_comp_id: &str) -> Self {
        EnvelopeHeaders {
            prefix: format!("49={}\x01", sender_comp_id).into_bytes(),
            suffix: format!("56={}\x01", target_comp_id).into_bytes(),
        }
    }

    pub(super) async fn write_all<W>(
        &self,
        w: &mut W,
        sending_time: DateTime<Utc>,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let sending_time_field = format!(
            "{}={}\x01",
            u32::from(Tags::SendingTime),
            sending_time.format(TIME_FORMAT)
        )
        .into_bytes();
        assert_eq!(sending_time_field.len(), 21 + 4);
        w.write_all(&self.prefix[..]).await?;
        w.write_all(&sending_time_field[..]).await?;
        w.write_all(&self.suffix[..]).await
    }

    pub(super) fn len(&self) -> usize {
        // 25 = "52=" + 21-byte timestamp + SOH
        self.prefix.len() + 25 + self.suffix.len()
    }
}
