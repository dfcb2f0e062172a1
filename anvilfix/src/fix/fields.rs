//! FIX 4.4 field and message-type catalog.
//!
//! Only the tags and message types the session layer and the order-entry
//! surface actually touch are listed. Anything absent from [`MsgType`] is,
//! by definition, not part of this engine's version spec and inbound
//! messages carrying such a type are rejected.

#![allow(non_camel_case_types, dead_code)]
#![allow(clippy::upper_case_acronyms)]

use crate::fix::decode::DecodeError;

pub fn is_session_message(msg_type: char) -> bool {
    matches!(msg_type, '0' | '1' | '2' | '3' | '4' | '5' | 'A')
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tags {
    Account = 1,
    AvgPx = 6,
    BeginSeqNo = 7,
    BeginString = 8,
    BodyLength = 9,
    CheckSum = 10,
    ClOrdID = 11,
    CumQty = 14,
    EndSeqNo = 16,
    ExecID = 17,
    HandlInst = 21,
    LastPx = 31,
    LastQty = 32,
    MsgSeqNum = 34,
    MsgType = 35,
    NewSeqNo = 36,
    OrderID = 37,
    OrderQty = 38,
    OrdStatus = 39,
    OrdType = 40,
    PossDupFlag = 43,
    Price = 44,
    RefSeqNum = 45,
    SecurityID = 48,
    SenderCompID = 49,
    SenderSubID = 50,
    SendingTime = 52,
    Side = 54,
    Symbol = 55,
    TargetCompID = 56,
    TargetSubID = 57,
    Text = 58,
    TimeInForce = 59,
    TransactTime = 60,
    Signature = 89,
    SecureDataLen = 90,
    SecureData = 91,
    SignatureLength = 93,
    RawDataLength = 95,
    RawData = 96,
    PossResend = 97,
    EncryptMethod = 98,
    StopPx = 99,
    OrdRejReason = 103,
    HeartBtInt = 108,
    TestReqID = 112,
    OnBehalfOfCompID = 115,
    OnBehalfOfSubID = 116,
    OrigSendingTime = 122,
    GapFillFlag = 123,
    DeliverToCompID = 128,
    DeliverToSubID = 129,
    ResetSeqNumFlag = 141,
    ExecType = 150,
    LeavesQty = 151,
    XmlDataLen = 212,
    XmlData = 213,
    RefTagID = 371,
    RefMsgType = 372,
    SessionRejectReason = 373,
    EncodedTextLen = 354,
    EncodedText = 355,
    Username = 553,
    Password = 554,
}

impl TryFrom<u32> for Tags {
    type Error = DecodeError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tags::Account),
            6 => Ok(Tags::AvgPx),
            7 => Ok(Tags::BeginSeqNo),
            8 => Ok(Tags::BeginString),
            9 => Ok(Tags::BodyLength),
            10 => Ok(Tags::CheckSum),
            11 => Ok(Tags::ClOrdID),
            14 => Ok(Tags::CumQty),
            16 => Ok(Tags::EndSeqNo),
            17 => Ok(Tags::ExecID),
            21 => Ok(Tags::HandlInst),
            31 => Ok(Tags::LastPx),
            32 => Ok(Tags::LastQty),
            34 => Ok(Tags::MsgSeqNum),
            35 => Ok(Tags::MsgType),
            36 => Ok(Tags::NewSeqNo),
            37 => Ok(Tags::OrderID),
            38 => Ok(Tags::OrderQty),
            39 => Ok(Tags::OrdStatus),
            40 => Ok(Tags::OrdType),
            43 => Ok(Tags::PossDupFlag),
            44 => Ok(Tags::Price),
            45 => Ok(Tags::RefSeqNum),
            48 => Ok(Tags::SecurityID),
            49 => Ok(Tags::SenderCompID),
            50 => Ok(Tags::SenderSubID),
            52 => Ok(Tags::SendingTime),
            54 => Ok(Tags::Side),
            55 => Ok(Tags::Symbol),
            56 => Ok(Tags::TargetCompID),
            57 => Ok(Tags::TargetSubID),
            58 => Ok(Tags::Text),
            59 => Ok(Tags::TimeInForce),
            60 => Ok(Tags::TransactTime),
            89 => Ok(Tags::Signature),
            90 => Ok(Tags::SecureDataLen),
            91 => Ok(Tags::SecureData),
            93 => Ok(Tags::SignatureLength),
            95 => Ok(Tags::RawDataLength),
            96 => Ok(Tags::RawData),
            97 => Ok(Tags::PossResend),
            98 => Ok(Tags::EncryptMethod),
            99 => Ok(Tags::StopPx),
            103 => Ok(Tags::OrdRejReason),
            108 => Ok(Tags::HeartBtInt),
            112 => Ok(Tags::TestReqID),
            115 => Ok(Tags::OnBehalfOfCompID),
            116 => Ok(Tags::OnBehalfOfSubID),
            122 => Ok(Tags::OrigSendingTime),
            123 => Ok(Tags::GapFillFlag),
            128 => Ok(Tags::DeliverToCompID),
            129 => Ok(Tags::DeliverToSubID),
            141 => Ok(Tags::ResetSeqNumFlag),
            150 => Ok(Tags::ExecType),
            151 => Ok(Tags::LeavesQty),
            212 => Ok(Tags::XmlDataLen),
            213 => Ok(Tags::XmlData),
            354 => Ok(Tags::EncodedTextLen),
            355 => Ok(Tags::EncodedText),
            371 => Ok(Tags::RefTagID),
            372 => Ok(Tags::RefMsgType),
            373 => Ok(Tags::SessionRejectReason),
            553 => Ok(Tags::Username),
            554 => Ok(Tags::Password),
            _ => Err(DecodeError::UnknownTag(value)),
        }
    }
}

impl From<Tags> for u32 {
    fn from(value: Tags) -> u32 {
        value as isize as u32
    }
}

/// Length-prefixed data fields: the tag carrying the length of the data tag
/// that follows it. The parser uses this to skip over raw values that may
/// contain SOH.
pub fn get_data_ref(tag: u32) -> Option<u32> {
    match tag {
        90 => Some(91),
        93 => Some(89),
        95 => Some(96),
        212 => Some(213),
        354 => Some(355),
        _ => None,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    HEARTBEAT = '0' as isize,
    TEST_REQUEST = '1' as isize,
    RESEND_REQUEST = '2' as isize,
    REJECT = '3' as isize,
    SEQUENCE_RESET = '4' as isize,
    LOGOUT = '5' as isize,
    INDICATION_OF_INTEREST = '6' as isize,
    ADVERTISEMENT = '7' as isize,
    EXECUTION_REPORT = '8' as isize,
    ORDER_CANCEL_REJECT = '9' as isize,
    LOGON = 'A' as isize,
    NEWS = 'B' as isize,
    EMAIL = 'C' as isize,
    ORDER_SINGLE = 'D' as isize,
    ORDER_LIST = 'E' as isize,
    ORDER_CANCEL_REQUEST = 'F' as isize,
    ORDER_CANCEL_REPLACE_REQUEST = 'G' as isize,
    ORDER_STATUS_REQUEST = 'H' as isize,
    ALLOCATION_INSTRUCTION = 'J' as isize,
    LIST_CANCEL_REQUEST = 'K' as isize,
    LIST_EXECUTE = 'L' as isize,
    LIST_STATUS_REQUEST = 'M' as isize,
    LIST_STATUS = 'N' as isize,
    ALLOCATION_INSTRUCTION_ACK = 'P' as isize,
    DONT_KNOW_TRADE = 'Q' as isize,
    QUOTE_REQUEST = 'R' as isize,
    QUOTE = 'S' as isize,
    SETTLEMENT_INSTRUCTIONS = 'T' as isize,
    MARKET_DATA_REQUEST = 'V' as isize,
    MARKET_DATA_SNAPSHOT_FULL_REFRESH = 'W' as isize,
    MARKET_DATA_INCREMENTAL_REFRESH = 'X' as isize,
    MARKET_DATA_REQUEST_REJECT = 'Y' as isize,
    QUOTE_CANCEL = 'Z' as isize,
    BUSINESS_MESSAGE_REJECT = 'j' as isize,
}

impl MsgType {
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            MsgType::HEARTBEAT
                | MsgType::TEST_REQUEST
                | MsgType::RESEND_REQUEST
                | MsgType::REJECT
                | MsgType::SEQUENCE_RESET
                | MsgType::LOGOUT
                | MsgType::LOGON
        )
    }
    pub fn is_application(&self) -> bool {
        !self.is_session()
    }

    /// Look up a wire `MsgType(35)` value in the version spec. Multi-byte
    /// values are not part of the catalog and return `None`.
    pub fn from_bytes(value: &[u8]) -> Option<MsgType> {
        if value.len() != 1 {
            return None;
        }
        MsgType::try_from(value[0] as char).ok()
    }
}

impl From<MsgType> for char {
    fn from(a: MsgType) -> char {
        a as isize as u8 as char
    }
}

impl TryFrom<char> for MsgType {
    type Error = DecodeError;
    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c {
            '0' => Ok(Self::HEARTBEAT),
            '1' => Ok(Self::TEST_REQUEST),
            '2' => Ok(Self::RESEND_REQUEST),
            '3' => Ok(Self::REJECT),
            '4' => Ok(Self::SEQUENCE_RESET),
            '5' => Ok(Self::LOGOUT),
            '6' => Ok(Self::INDICATION_OF_INTEREST),
            '7' => Ok(Self::ADVERTISEMENT),
            '8' => Ok(Self::EXECUTION_REPORT),
            '9' => Ok(Self::ORDER_CANCEL_REJECT),
            'A' => Ok(Self::LOGON),
            'B' => Ok(Self::NEWS),
            'C' => Ok(Self::EMAIL),
            'D' => Ok(Self::ORDER_SINGLE),
            'E' => Ok(Self::ORDER_LIST),
            'F' => Ok(Self::ORDER_CANCEL_REQUEST),
            'G' => Ok(Self::ORDER_CANCEL_REPLACE_REQUEST),
            'H' => Ok(Self::ORDER_STATUS_REQUEST),
            'J' => Ok(Self::ALLOCATION_INSTRUCTION),
            'K' => Ok(Self::LIST_CANCEL_REQUEST),
            'L' => Ok(Self::LIST_EXECUTE),
            'M' => Ok(Self::LIST_STATUS_REQUEST),
            'N' => Ok(Self::LIST_STATUS),
            'P' => Ok(Self::ALLOCATION_INSTRUCTION_ACK),
            'Q' => Ok(Self::DONT_KNOW_TRADE),
            'R' => Ok(Self::QUOTE_REQUEST),
            'S' => Ok(Self::QUOTE),
            'T' => Ok(Self::SETTLEMENT_INSTRUCTIONS),
            'V' => Ok(Self::MARKET_DATA_REQUEST),
            'W' => Ok(Self::MARKET_DATA_SNAPSHOT_FULL_REFRESH),
            'X' => Ok(Self::MARKET_DATA_INCREMENTAL_REFRESH),
            'Y' => Ok(Self::MARKET_DATA_REQUEST_REJECT),
            'Z' => Ok(Self::QUOTE_CANCEL),
            'j' => Ok(Self::BUSINESS_MESSAGE_REJECT),
            _ => Err(DecodeError::UnknownChar(Tags::MsgType.into(), c)),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejectReason {
    INVALID_TAG_NUMBER,
    REQUIRED_TAG_MISSING,
    TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE,
    UNDEFINED_TAG,
    TAG_SPECIFIED_WITHOUT_A_VALUE,
    VALUE_IS_INCORRECT,
    INCORRECT_DATA_FORMAT_FOR_VALUE,
    DECRYPTION_PROBLEM,
    SIGNATURE_PROBLEM,
    COMPID_PROBLEM,
    SENDINGTIME_ACCURACY_PROBLEM,
    INVALID_MSGTYPE,
}

#[allow(clippy::from_over_into)]
impl Into<u32> for &SessionRejectReason {
    fn into(self) -> u32 {
        match *self {
            SessionRejectReason::INVALID_TAG_NUMBER => 0,
            SessionRejectReason::REQUIRED_TAG_MISSING => 1,
            SessionRejectReason::TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE => 2,
            SessionRejectReason::UNDEFINED_TAG => 3,
            SessionRejectReason::TAG_SPECIFIED_WITHOUT_A_VALUE => 4,
            SessionRejectReason::VALUE_IS_INCORRECT => 5,
            SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE => 6,
            SessionRejectReason::DECRYPTION_PROBLEM => 7,
            SessionRejectReason::SIGNATURE_PROBLEM => 8,
            SessionRejectReason::COMPID_PROBLEM => 9,
            SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM => 10,
            SessionRejectReason::INVALID_MSGTYPE => 11,
        }
    }
}

#[allow(clippy::from_over_into)]
impl Into<String> for &SessionRejectReason {
    fn into(self) -> String {
        match *self {
            SessionRejectReason::INVALID_TAG_NUMBER => String::from("Invalid tag number"),
            SessionRejectReason::REQUIRED_TAG_MISSING => String::from("Required tag missing"),
            SessionRejectReason::TAG_NOT_DEFINED_FOR_THIS_MESSAGE_TYPE => {
                String::from("Tag not defined for this message type")
            }
            SessionRejectReason::UNDEFINED_TAG => String::from("Undefined tag"),
            SessionRejectReason::TAG_SPECIFIED_WITHOUT_A_VALUE => {
                String::from("Tag specified without a value")
            }
            SessionRejectReason::VALUE_IS_INCORRECT => String::from("Value is incorrect"),
            SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE => {
                String::from("Incorrect data format for value")
            }
            SessionRejectReason::DECRYPTION_PROBLEM => String::from("Decryption problem"),
            SessionRejectReason::SIGNATURE_PROBLEM => String::from("Signature problem"),
            SessionRejectReason::COMPID_PROBLEM => String::from("CompID problem"),
            SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM => {
                String::from("SendingTime accuracy problem")
            }
            SessionRejectReason::INVALID_MSGTYPE => String::from("Invalid MsgType"),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PossDupFlag {
    YES = 'Y' as isize,
    NO = 'N' as isize,
}

impl TryFrom<char> for PossDupFlag {
    type Error = DecodeError;
    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c {
            'Y' => Ok(Self::YES),
            'N' => Ok(Self::NO),
            _ => Err(DecodeError::UnknownChar(Tags::PossDupFlag.into(), c)),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapFillFlag {
    YES = 'Y' as isize,
    NO = 'N' as isize,
}

impl TryFrom<char> for GapFillFlag {
    type Error = DecodeError;
    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c {
            'Y' => Ok(Self::YES),
            'N' => Ok(Self::NO),
            _ => Err(DecodeError::UnknownChar(Tags::GapFillFlag.into(), c)),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    BUY = '1' as isize,
    SELL = '2' as isize,
}

impl From<Side> for &'static [u8] {
    fn from(a: Side) -> &'static [u8] {
        match a {
            Side::BUY => b"1",
            Side::SELL => b"2",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdType {
    MARKET = '1' as isize,
    LIMIT = '2' as isize,
    STOP = '3' as isize,
    STOP_LIMIT = '4' as isize,
}

impl From<OrdType> for &'static [u8] {
    fn from(a: OrdType) -> &'static [u8] {
        match a {
            OrdType::MARKET => b"1",
            OrdType::LIMIT => b"2",
            OrdType::STOP => b"3",
            OrdType::STOP_LIMIT => b"4",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    DAY = '0' as isize,
    GOOD_TILL_CANCEL = '1' as isize,
    IMMEDIATE_OR_CANCEL = '3' as isize,
    FILL_OR_KILL = '4' as isize,
}

impl From<TimeInForce> for &'static [u8] {
    fn from(a: TimeInForce) -> &'static [u8] {
        match a {
            TimeInForce::DAY => b"0",
            TimeInForce::GOOD_TILL_CANCEL => b"1",
            TimeInForce::IMMEDIATE_OR_CANCEL => b"3",
            TimeInForce::FILL_OR_KILL => b"4",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdStatus {
    NEW = '0' as isize,
    PARTIALLY_FILLED = '1' as isize,
    FILLED = '2' as isize,
    CANCELED = '4' as isize,
    REJECTED = '8' as isize,
}

impl From<OrdStatus> for &'static [u8] {
    fn from(a: OrdStatus) -> &'static [u8] {
        match a {
            OrdStatus::NEW => b"0",
            OrdStatus::PARTIALLY_FILLED => b"1",
            OrdStatus::FILLED => b"2",
            OrdStatus::CANCELED => b"4",
            OrdStatus::REJECTED => b"8",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    NEW = '0' as isize,
    PARTIAL_FILL = '1' as isize,
    FILL = '2' as isize,
    CANCELED = '4' as isize,
    REJECTED = '8' as isize,
}

impl From<ExecType> for &'static [u8] {
    fn from(a: ExecType) -> &'static [u8] {
        match a {
            ExecType::NEW => b"0",
            ExecType::PARTIAL_FILL => b"1",
            ExecType::FILL => b"2",
            ExecType::CANCELED => b"4",
            ExecType::REJECTED => b"8",
        }
    }
}
