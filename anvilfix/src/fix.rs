//! The FIX session layer: framing, [encoding], [decoding], validation and
//! the per-connection session task.
//!
//! [encoding]: crate::fix::encode
//! [decoding]: crate::fix::decode

use chrono::Utc;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use anyhow::{bail, Result};
use thiserror::Error;

use crate::fix::decode::{parse_field, parse_sending_time};
use crate::fix::encode::{EnvelopeHeaders, MessageBuilder, SerializedInt};
use crate::fix::fields::{
    is_session_message, GapFillFlag, MsgType, PossDupFlag, SessionRejectReason, Tags,
};
use crate::fix::log::{LogLevel, Logger, WireJournal};
use crate::fix::mem::MsgBuf;
use crate::fix::resend::Transformer;
use crate::fix::session::{Event, Sequences, SessionMachine};
use crate::fix::stopwatch::FixTimeouts;
use crate::fix::store::{Direction, MessageStore};
use crate::fix::validate::validate_msg;
use crate::{FixHandle, RecvHandler, Request, SessionRef};

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub mod decode;
pub mod encode;
pub mod fields;
pub mod log;
pub mod mem;
pub mod store;

mod checksum;
mod resend;
pub(crate) mod session;
mod stopwatch;
mod stream;
mod validate;

/// Errors raised while conducting a session. Most never unwind out of the
/// session task: peer-protocol violations are answered on the wire and
/// surface through the logging hook.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("An I/O error occured: {0}")]
    IoError(#[from] io::Error),
    #[error("A garbled message was received: {text}")]
    GarbledMessage {
        text: String,
        garbled_msg_type: GarbledMessageType,
    },
    #[error("A message was received without a sequence number")]
    MissingMsgSeqNum { text: String },
    #[error("A message was rejected because: {text}")]
    MessageRejected {
        text: String,
        reject_reason: Option<SessionRejectReason>,
        msg_seq_num: u32,
        ref_tag_id: Option<u32>,
        ref_msg_type: Option<String>,
    },
    #[error("Tried to resend a malformed message")]
    ResendError,
    #[error("TCP peer closed their half of the connection")]
    TcpDisconnection,
}

#[derive(Debug)]
pub enum GarbledMessageType {
    BeginStringIssue,
    BodyLengthIssue,
    MsgTypeIssue,
    ChecksumIssue,
    Other,
}

impl SessionError {
    fn new_message_rejected(
        text: Option<String>,
        reason: Option<SessionRejectReason>,
        seq_num: u32,
        tag_id: Option<u32>,
        msg_type: Option<String>,
    ) -> SessionError {
        SessionError::MessageRejected {
            text: text.unwrap_or_else(|| reason.as_ref().map_or(String::new(), |r| r.into())),
            reject_reason: reason,
            msg_seq_num: seq_num,
            ref_tag_id: tag_id,
            ref_msg_type: msg_type,
        }
    }

    fn new_garbled_message(text: String, t: GarbledMessageType) -> SessionError {
        SessionError::GarbledMessage {
            text,
            garbled_msg_type: t,
        }
    }
}

/// Which end of the TCP connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Acceptor,
}

/// Everything a session task needs to run one connection. Built by the
/// initiator's `connect` or by the acceptor per accepted socket.
pub(crate) struct SessionContext {
    pub(crate) role: Role,
    pub(crate) begin_string: Arc<String>,
    pub(crate) sender_comp_id: String,
    /// Peer CompID. `None` on acceptor sessions until the first inbound
    /// frame teaches it.
    pub(crate) target_comp_id: Option<String>,
    /// Pre-opened store (initiator). Acceptor sessions open theirs lazily
    /// under `store_dir`.
    pub(crate) store: Option<MessageStore>,
    pub(crate) store_dir: Option<PathBuf>,
    pub(crate) log_dir: PathBuf,
    pub(crate) heartbeat: Duration,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) sequences: Arc<Sequences>,
    pub(crate) handle: FixHandle,
    /// Acceptor only: where the learned peer CompID is published for the
    /// engine registry.
    pub(crate) target_slot: Option<Arc<OnceLock<String>>>,
}

struct SessionResources {
    store: Option<MessageStore>,
    journal: Option<WireJournal>,
    envelope: Option<EnvelopeHeaders>,
}

fn is_session_msg_type(msg_type: &[u8]) -> bool {
    msg_type.len() == 1 && is_session_message(msg_type[0] as char)
}

#[derive(Default)]
struct SessionParserCallback<'a> {
    msg_type: Vec<u8>,
    msg_seq_num: u32,
    sender_comp_id: Option<&'a [u8]>,
    target_comp_id: Option<&'a [u8]>,
    poss_dup_flag: Option<char>,
    gap_fill: Option<char>,
    new_seq_no: Option<u32>,
    test_req_id: Option<&'a [u8]>,
    begin_seq_no: Option<u32>,
    end_seq_no: Option<u32>,
    heart_bt_int: Option<u32>,
    sending_time: Option<chrono::DateTime<Utc>>,
    orig_sending_time: Option<chrono::DateTime<Utc>>,
    encrypt_method: Option<u32>,
    reset_seq_num_flag: Option<char>,
    text: Option<&'a [u8]>,
}

impl<'a> crate::fix::decode::ParserCallback<'a> for SessionParserCallback<'a> {
    fn header(&mut self, key: u32, value: &'a [u8]) -> Result<bool, SessionError> {
        match key.try_into() {
            Ok(Tags::MsgType) => {
                self.msg_type = value.to_vec();
            }
            Ok(Tags::MsgSeqNum) => {
                self.msg_seq_num = parse_field::<u32>(value).map_err(|_| {
                    SessionError::MissingMsgSeqNum {
                        text: String::from("Missing MsgSeqNum"),
                    }
                })?;
            }
            Ok(Tags::TargetCompID) => {
                self.target_comp_id = Some(value);
            }
            Ok(Tags::SenderCompID) => {
                self.sender_comp_id = Some(value);
            }
            Ok(Tags::PossDupFlag) => {
                if value.len() == 1 {
                    self.poss_dup_flag = Some(value[0] as char);
                } else {
                    return Err(self.create_message_reject(
                        SessionRejectReason::VALUE_IS_INCORRECT,
                        Tags::PossDupFlag,
                    ));
                }
            }
            Ok(Tags::SendingTime) => match parse_sending_time(value) {
                Ok(sending_time) => {
                    self.sending_time = Some(sending_time);
                }
                Err(_) => {
                    return Err(self.create_message_reject(
                        SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
                        Tags::SendingTime,
                    ));
                }
            },
            Ok(Tags::OrigSendingTime) => match parse_sending_time(value) {
                Ok(sending_time) => {
                    self.orig_sending_time = Some(sending_time);
                }
                Err(_) => {
                    return Err(self.create_message_reject(
                        SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
                        Tags::OrigSendingTime,
                    ));
                }
            },
            _ => (),
        }
        Ok(true)
    }

    fn body(&mut self, key: u32, value: &'a [u8]) -> Result<bool, SessionError> {
        if !is_session_msg_type(&self.msg_type) {
            return Ok(false);
        }
        match key.try_into() {
            Ok(Tags::GapFillFlag) => {
                if value.len() == 1 {
                    self.gap_fill = Some(value[0] as char);
                } else {
                    return Err(self.create_message_reject(
                        SessionRejectReason::VALUE_IS_INCORRECT,
                        Tags::GapFillFlag,
                    ));
                }
            }
            Ok(Tags::NewSeqNo) => {
                self.new_seq_no =
                    Some(parse_field::<u32>(value).or(Err(self.create_message_reject(
                        SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
                        Tags::NewSeqNo,
                    )))?);
            }
            Ok(Tags::TestReqID) => {
                self.test_req_id = Some(value);
            }
            Ok(Tags::BeginSeqNo) => {
                self.begin_seq_no =
                    Some(parse_field::<u32>(value).or(Err(self.create_message_reject(
                        SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
                        Tags::BeginSeqNo,
                    )))?);
            }
            Ok(Tags::EndSeqNo) => {
                self.end_seq_no =
                    Some(parse_field::<u32>(value).or(Err(self.create_message_reject(
                        SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
                        Tags::EndSeqNo,
                    )))?);
            }
            Ok(Tags::HeartBtInt) => {
                self.heart_bt_int =
                    Some(parse_field::<u32>(value).or(Err(self.create_message_reject(
                        SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
                        Tags::HeartBtInt,
                    )))?)
            }
            Ok(Tags::EncryptMethod) => {
                self.encrypt_method =
                    Some(parse_field::<u32>(value).or(Err(self.create_message_reject(
                        SessionRejectReason::INCORRECT_DATA_FORMAT_FOR_VALUE,
                        Tags::EncryptMethod,
                    )))?);
            }
            Ok(Tags::ResetSeqNumFlag) => {
                if value.len() == 1 {
                    self.reset_seq_num_flag = Some(value[0] as char);
                } else {
                    return Err(self.create_message_reject(
                        SessionRejectReason::VALUE_IS_INCORRECT,
                        Tags::ResetSeqNumFlag,
                    ));
                }
            }
            Ok(Tags::Text) => {
                self.text = Some(value);
            }
            _ => (),
        }
        Ok(true)
    }

    fn trailer(&mut self, _key: u32, _value: &'a [u8]) -> Result<bool, SessionError> {
        Ok(false)
    }

    fn sequence_num(&self) -> u32 {
        self.msg_seq_num
    }
}

impl SessionParserCallback<'_> {
    fn create_message_reject(&self, reason: SessionRejectReason, ref_tag: Tags) -> SessionError {
        SessionError::new_message_rejected(
            None,
            Some(reason),
            self.msg_seq_num,
            Some(ref_tag.into()),
            Some(String::from_utf8_lossy(&self.msg_type).into_owned()),
        )
    }
}

/// Runs one FIX connection to completion: the single consumer of the socket
/// and the single producer of its outbound frames, which is what makes the
/// outbound sequence assignment and write atomic without a mutex.
pub(crate) async fn run_session(
    mut stream: TcpStream,
    mut request_receiver: mpsc::UnboundedReceiver<Request>,
    handler: Arc<dyn RecvHandler>,
    mut ctx: SessionContext,
) -> Result<()> {
    // SETUP

    let logger = Arc::clone(&ctx.logger);
    let mut resources = SessionResources {
        store: ctx.store.take(),
        journal: None,
        envelope: None,
    };
    if let Some(target) = ctx.target_comp_id.as_deref() {
        resources.envelope = Some(EnvelopeHeaders::new(&ctx.sender_comp_id, target));
        resources.journal = Some(
            WireJournal::open(&ctx.log_dir, &format!("{}-{}", ctx.sender_comp_id, target)).await?,
        );
    }

    let mut state_machine = SessionMachine::new(
        Arc::clone(&ctx.begin_string),
        ctx.heartbeat.as_secs() as u32,
        ctx.username.clone(),
        ctx.password.clone(),
        Arc::clone(&logger),
        Arc::clone(&ctx.sequences),
    );

    match ctx.role {
        Role::Acceptor => {
            state_machine.handle(&Event::Accept);
        }
        Role::Initiator => {
            let logon_resp_sender = receive_logon_request(&mut request_receiver).await;
            state_machine.set_logon_resp_sender(logon_resp_sender);
            state_machine.handle(&Event::Connect);
        }
    }

    let heartbt_dur = ctx.heartbeat;
    let mut fix_timeouts = FixTimeouts::new(
        heartbt_dur,
        test_request_duration(&heartbt_dur),
        logout_duration(&heartbt_dur),
    );

    let mut prefix_buf: stream::PrefixBuf<{ stream::PEEK_LEN }> = stream::PrefixBuf::new();

    // LOOP

    loop {
        send_outgoing_messages(
            &mut state_machine,
            &mut stream,
            &mut resources,
            &mut fix_timeouts,
            &logger,
        )
        .await?;

        if session::should_disconnect(&state_machine) {
            let resp = disconnect(request_receiver, &resources, stream).await;
            let logout_success = !session::in_error_state(&state_machine);
            state_machine.send_logout_response(logout_success && resp.is_ok());
            resp?;
            break;
        }

        let (deadline, timer_kind) = fix_timeouts.next_deadline();

        tokio::select! {
            biased;

            Some(req) = request_receiver.recv() => {
                handle_req(req, &mut state_machine)
            }
            maybe_err = stream::read_prefix(&mut stream, &mut prefix_buf) => {
                let maybe_message = match maybe_err {
                    Ok(()) => stream::read_frame(&mut stream, &mut prefix_buf, logger.as_ref()).await,
                    Err(SessionError::IoError(e)) => bail!("{e:?}"),
                    Err(e) => Err(e),
                };

                if let Err(SessionError::IoError(e)) = maybe_message {
                    bail!("{e:?}");
                }

                handle_msg(
                    maybe_message,
                    &mut state_machine,
                    &mut fix_timeouts,
                    &mut ctx,
                    &mut resources,
                    &mut stream,
                    handler.as_ref(),
                ).await?;
            }
            _ = tokio::time::sleep_until(deadline) => {
                fix_timeouts.mark_fired(timer_kind);
                state_machine.handle(&timer_kind.into_event());
            }
        };
    }

    Ok(())
}

fn test_request_duration(timeout_dur: &Duration) -> Duration {
    (*timeout_dur * 17) / 10
}

fn logout_duration(timeout_dur: &Duration) -> Duration {
    *timeout_dur * 2
}

fn handle_req(req: Request, state_machine: &mut SessionMachine) {
    match req {
        Request::SendMessage {
            resp_sender,
            builder,
        } => {
            state_machine.outbox_push_with_sender(builder, resp_sender);
        }
        Request::Logout { resp_sender } => {
            let begin_string = Arc::clone(&state_machine.begin_string);
            state_machine.outbox_push_with_sender(
                crate::fix::session::build_logout_message(&begin_string),
                resp_sender,
            );
        }
        Request::Logon { resp_sender } => {
            let _ = resp_sender.send(true);
        }
    }
}

/// Acceptor first-frame side effect: adopt the peer CompID, open the store
/// and journal, and publish the identity to the engine registry. Returns
/// false if the frame carried no `SenderCompID(49)`, which drops the
/// session.
async fn adopt_peer_identity(
    ctx: &mut SessionContext,
    resources: &mut SessionResources,
    sender_comp_id: Option<&[u8]>,
) -> Result<bool> {
    let target = match sender_comp_id {
        Some(sender) if !sender.is_empty() => String::from_utf8_lossy(sender).into_owned(),
        _ => {
            ctx.logger.log(
                LogLevel::Error,
                "first frame carried no SenderCompID(49), dropping session",
            );
            return Ok(false);
        }
    };

    if let Some(dir) = ctx.store_dir.as_ref() {
        let file_name = format!("{}-{}.fix", target, Utc::now().format("%Y%m%d.%H%M%S"));
        resources.store = Some(MessageStore::create(&dir.join(file_name), &target).await?);
    }
    resources.journal = Some(
        WireJournal::open(&ctx.log_dir, &format!("{}-{}", ctx.sender_comp_id, target)).await?,
    );
    resources.envelope = Some(EnvelopeHeaders::new(&ctx.sender_comp_id, &target));

    if let Some(slot) = ctx.target_slot.as_ref() {
        let _ = slot.set(target.clone());
    }
    if ctx.logger.enabled(LogLevel::Info) {
        ctx.logger.log(
            LogLevel::Info,
            &format!("session peer identified as '{}'", target),
        );
    }
    ctx.target_comp_id = Some(target);
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
async fn handle_msg(
    maybe_msg: Result<MsgBuf, SessionError>,
    state_machine: &mut SessionMachine,
    fix_timeouts: &mut FixTimeouts,
    ctx: &mut SessionContext,
    resources: &mut SessionResources,
    stream: &mut TcpStream,
    handler: &dyn RecvHandler,
) -> Result<()> {
    fix_timeouts.reset_test_request();

    let msg = match maybe_msg {
        Ok(b) => Arc::new(b),
        Err(error) => {
            ctx.logger.log(
                LogLevel::Warn,
                &format!("discarding unprocessable frame: {error}"),
            );
            state_machine.handle(&Event::SessionErrorReceived { error });
            return Ok(());
        }
    };

    // PARSE

    let mut cb: SessionParserCallback = Default::default();

    if let Err(error) = crate::fix::decode::parse(&msg.as_ref()[..], &mut cb) {
        state_machine.handle(&Event::SessionErrorReceived { error });
        return Ok(());
    };

    // An acceptor session learns who it is talking to from the first frame.
    if ctx.target_comp_id.is_none()
        && !adopt_peer_identity(ctx, resources, cb.sender_comp_id).await?
    {
        state_machine.handle(&Event::SessionErrorReceived {
            error: SessionError::new_garbled_message(
                String::from("first frame carried no SenderCompID(49)"),
                GarbledMessageType::Other,
            ),
        });
        return Ok(());
    }

    if let Some(journal) = resources.journal.as_ref() {
        let _ = journal.record(&msg);
    }

    // Every received frame lands in the store, valid or not.
    if let Some(store) = resources.store.as_ref() {
        if let Err(e) = store
            .add(cb.msg_seq_num, Direction::Recv, Arc::clone(&msg))
            .await
        {
            ctx.logger.log(
                LogLevel::Error,
                &format!("failed to store received message {}: {e:?}", cb.msg_seq_num),
            );
        }
    }

    // VALIDATE

    let expected_sender = match ctx.target_comp_id.as_deref() {
        Some(t) => t,
        None => return Ok(()),
    };

    if let Err(error) = validate_msg(
        expected_sender,
        &ctx.sender_comp_id,
        &cb.msg_type,
        cb.msg_seq_num,
        cb.sender_comp_id,
        cb.target_comp_id,
        cb.sending_time,
        cb.poss_dup_flag,
        cb.orig_sending_time,
        cb.begin_seq_no,
        cb.end_seq_no,
    ) {
        state_machine.handle(&Event::SessionErrorReceived { error });
        return Ok(());
    }

    if let Err(error) = validate::validate_checksum(&msg) {
        state_machine.handle(&Event::SessionErrorReceived { error });
        return Ok(());
    }

    // HANDLE

    let msg_seq_num = cb.msg_seq_num;

    match MsgType::from_bytes(&cb.msg_type) {
        Some(MsgType::LOGON) => {
            let mut heartbt_secs = ctx.heartbeat.as_secs() as u32;
            if let Some(i) = cb.heart_bt_int {
                heartbt_secs = i;
                let heartbt_dur = tokio::time::Duration::from_secs(i as u64);
                fix_timeouts.set_durations(
                    heartbt_dur,
                    test_request_duration(&heartbt_dur),
                    logout_duration(&heartbt_dur),
                );
            }
            state_machine.handle(&Event::LogonReceived(
                msg_seq_num,
                heartbt_secs,
                cb.encrypt_method,
                cb.reset_seq_num_flag.map(|f| f == 'Y').unwrap_or(false),
                to_poss_dup_flag(cb.poss_dup_flag),
            ));
        }
        Some(MsgType::LOGOUT) => {
            state_machine.handle(&Event::LogoutReceived(
                msg_seq_num,
                to_poss_dup_flag(cb.poss_dup_flag),
            ));
        }
        Some(MsgType::HEARTBEAT) => {
            state_machine.handle(&Event::HeartbeatReceived(
                msg_seq_num,
                to_poss_dup_flag(cb.poss_dup_flag),
            ));
        }
        Some(MsgType::SEQUENCE_RESET) => {
            if let Some(nsn) = cb.new_seq_no {
                let maybe_gap_fill = cb
                    .gap_fill
                    .map(GapFillFlag::try_from)
                    .transpose()
                    .map_err(anyhow::Error::msg)?;
                state_machine.handle(&Event::SequenceResetReceived {
                    msg_seq_num,
                    gap_fill: maybe_gap_fill,
                    new_seq_no: nsn,
                    poss_dup: to_poss_dup_flag(cb.poss_dup_flag),
                })
            }
        }
        Some(MsgType::REJECT) => {
            ctx.logger.log(
                LogLevel::Warn,
                &format!(
                    "peer rejected message: {}",
                    String::from_utf8_lossy(cb.text.unwrap_or(b"<no text>"))
                ),
            );
            state_machine.handle(&Event::RejectReceived(
                msg_seq_num,
                to_poss_dup_flag(cb.poss_dup_flag),
            ));
        }
        Some(MsgType::TEST_REQUEST) => {
            if let Some(test_req_id) = cb.test_req_id {
                state_machine.handle(&Event::TestRequestReceived {
                    msg_seq_num,
                    test_req_id: test_req_id.to_owned(),
                    poss_dup: to_poss_dup_flag(cb.poss_dup_flag),
                })
            }
        }
        Some(MsgType::RESEND_REQUEST) => {
            let e = match cb.end_seq_no {
                Some(n) if n > 0 => n,
                _ => state_machine.sequences.peek_outgoing().saturating_sub(1),
            };
            let b = cb.begin_seq_no.unwrap_or(e);

            if session::should_resend(state_machine) {
                if let Some(store) = resources.store.as_ref() {
                    let prev_messages = store.sent_range(b, e).await?;
                    resend_messages(
                        prev_messages,
                        stream,
                        resources.envelope.as_ref(),
                        &state_machine.begin_string,
                        resources.journal.as_ref(),
                    )
                    .await?;
                }
            }
            state_machine.handle(&Event::ResendRequestReceived(
                cb.msg_seq_num,
                b,
                e,
                to_poss_dup_flag(cb.poss_dup_flag),
            ));
        }
        Some(ref msg_type) if msg_type.is_application() => {
            if session::should_pass_app_message(state_machine, msg_seq_num) {
                if let Some(target) = ctx.target_comp_id.clone() {
                    let session_ref = SessionRef::new(target, ctx.handle.clone());
                    handler.on_message(&session_ref, Arc::clone(&msg));
                }
            }
            state_machine.handle(&Event::ApplicationMessageReceived(
                msg_seq_num,
                to_poss_dup_flag(cb.poss_dup_flag),
            ));
        }
        _ => {
            // validate_msg already rejected unknown types; nothing to do
        }
    }
    Ok(())
}

async fn disconnect(
    mut request_receiver: mpsc::UnboundedReceiver<Request>,
    resources: &SessionResources,
    stream: TcpStream,
) -> Result<()> {
    request_receiver.close();
    if let Some(store) = resources.store.as_ref() {
        store.close().await?;
    }
    if let Some(journal) = resources.journal.as_ref() {
        journal.disconnect().await?;
    }
    stream::disconnect(stream).await;
    Ok(())
}

async fn receive_logon_request(
    request_receiver: &mut mpsc::UnboundedReceiver<Request>,
) -> Option<oneshot::Sender<bool>> {
    loop {
        match request_receiver.recv().await {
            Some(Request::Logon { resp_sender }) => {
                return Some(resp_sender);
            }
            Some(Request::SendMessage { resp_sender, .. }) => {
                let _ = resp_sender.send(false);
            }
            Some(Request::Logout { resp_sender, .. }) => {
                let _ = resp_sender.send(true);
            }
            None => {
                return None;
            }
        }
    }
}

async fn send_outgoing_messages(
    state_machine: &mut SessionMachine,
    stream: &mut TcpStream,
    resources: &mut SessionResources,
    fix_timeouts: &mut FixTimeouts,
    logger: &Arc<dyn Logger>,
) -> Result<(), SessionError> {
    if !state_machine.outbox.is_empty() {
        fix_timeouts.reset_heartbeat();
    }
    while let Some((msg, maybe_resp_sender)) = state_machine.outbox_pop() {
        let envelope = match resources.envelope.as_ref() {
            Some(e) => e,
            None => {
                // nothing can be addressed before the peer CompID is known
                logger.log(
                    LogLevel::Error,
                    "outbound message dropped: peer CompID not yet known",
                );
                if let Some(resp_sender) = maybe_resp_sender {
                    let _ = resp_sender.send(false);
                }
                continue;
            }
        };
        let is_logout = msg.msg_type() == MsgType::LOGOUT.into();

        let msg_seq_num = state_machine.sequences.next_outgoing();
        let msg_buf = build_message_with_envelope(msg, msg_seq_num, envelope).await?;
        if let Err(e) = stream::send_frame(&msg_buf, stream).await {
            // assigned sequence numbers are never rolled back; the peer
            // recovers the hole through resend
            if let Some(resp_sender) = maybe_resp_sender {
                let _ = resp_sender.send(false);
            }
            match e {
                SessionError::TcpDisconnection => {
                    state_machine.handle(&Event::SessionErrorReceived {
                        error: SessionError::TcpDisconnection,
                    });
                    return Ok(());
                }
                e => {
                    logger.log(
                        LogLevel::Error,
                        &format!("failed to write message {}: {e:?}", msg_seq_num),
                    );
                    continue;
                }
            }
        }
        if let Some(journal) = resources.journal.as_ref() {
            let _ = journal.record(&msg_buf);
        }

        if let Some(store) = resources.store.as_ref() {
            if let Err(e) = store
                .add(msg_seq_num, Direction::Send, Arc::new(msg_buf))
                .await
            {
                logger.log(
                    LogLevel::Error,
                    &format!("failed to store sent message {}: {e:?}", msg_seq_num),
                );
            }
        }

        if is_logout {
            state_machine.outbox_clear();
            state_machine.set_logout_resp_sender(maybe_resp_sender);
            state_machine.handle(&Event::LogoutSent);
            fix_timeouts.start_logout_timeout();
            break;
        } else if let Some(resp_sender) = maybe_resp_sender {
            let _ = resp_sender.send(true);
        }
    }
    Ok(())
}

/// Replay stored messages for a `ResendRequest(2)`. Application messages go
/// back out with `PossDupFlag(43)=Y` and their original `SendingTime(52)`
/// preserved in `OrigSendingTime(122)`; runs of administrative messages
/// collapse into gap-fill `SequenceReset(4)` frames.
async fn resend_messages<W: AsyncWrite + Unpin>(
    messages: Vec<(u32, Vec<u8>)>,
    sink: &mut W,
    envelope: Option<&EnvelopeHeaders>,
    begin_string: &str,
    journal: Option<&WireJournal>,
) -> Result<(), SessionError> {
    let envelope = match envelope {
        Some(e) => e,
        None => return Ok(()),
    };
    let mut gap_start: Option<u32> = None;
    let mut last_seq: Option<u32> = None;
    for (msg_seq_num, msg) in messages.into_iter() {
        last_seq = Some(msg_seq_num);
        let transformer = Transformer::try_from(msg)?;
        if is_session_msg_type(transformer.msg_type()) {
            gap_start.get_or_insert(msg_seq_num);
            continue;
        }
        if let Some(start) = gap_start.take() {
            let msg_buf = build_gap_fill_msg(start, msg_seq_num, envelope, begin_string).await?;
            stream::send_frame(&msg_buf, sink).await?;
            record(journal, &msg_buf);
        }
        let msg_buf = transform_message(transformer).await?;
        stream::send_frame(&msg_buf, sink).await?;
        record(journal, &msg_buf);
    }
    if let (Some(start), Some(last)) = (gap_start, last_seq) {
        let msg_buf = build_gap_fill_msg(start, last + 1, envelope, begin_string).await?;
        stream::send_frame(&msg_buf, sink).await?;
        record(journal, &msg_buf);
    }
    Ok(())
}

fn record(journal: Option<&WireJournal>, msg_buf: &MsgBuf) {
    if let Some(journal) = journal {
        let _ = journal.record(msg_buf);
    }
}

async fn build_message_with_envelope(
    msg: MessageBuilder,
    msg_seq_num: u32,
    envelope: &EnvelopeHeaders,
) -> Result<MsgBuf, SessionError> {
    let mut buf = Vec::with_capacity(1024);

    msg.build_async(&mut buf, msg_seq_num, envelope, Utc::now())
        .await?;
    Ok(buf.into())
}

/// A gap-fill `SequenceReset(4)` covering `[msg_seq_num, new_seq_num)`.
async fn build_gap_fill_msg(
    msg_seq_num: u32,
    new_seq_num: u32,
    envelope: &EnvelopeHeaders,
    begin_string: &str,
) -> Result<MsgBuf, SessionError> {
    let builder = MessageBuilder::new(begin_string, MsgType::SEQUENCE_RESET.into())
        .push(Tags::PossDupFlag, b"Y")
        .push(Tags::GapFillFlag, b"Y")
        .push(Tags::NewSeqNo, SerializedInt::from(new_seq_num).as_bytes());
    build_message_with_envelope(builder, msg_seq_num, envelope).await
}

async fn transform_message(transformer: Transformer) -> Result<MsgBuf, SessionError> {
    let mut buf = Vec::new();
    let mut cur = tokio::io::BufWriter::new(&mut buf);
    transformer
        .build_async(&mut cur)
        .await
        .or(Err(SessionError::ResendError))?;
    tokio::io::AsyncWriteExt::flush(&mut cur).await?;
    Ok(buf.into())
}

fn to_poss_dup_flag(maybe_flag: Option<char>) -> Option<PossDupFlag> {
    maybe_flag.map(|f| PossDupFlag::try_from(f).unwrap_or(PossDupFlag::NO))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::checksum::calc_checksum;

    fn frame(body: &str) -> Vec<u8> {
        let mut v = format!("8=FIX.4.4\x019={}\x01{}", body.len(), body).into_bytes();
        let cs = calc_checksum(&v);
        v.extend_from_slice(format!("10={:03}\x01", cs).as_bytes());
        v
    }

    #[test]
    fn test_session_parser_callback_logon() {
        let msg = frame(
            "35=A\x0134=1\x0149=Client\x0152=20240506-13:59:15.021\x0156=Server\x0198=0\x01108=30\x01141=Y\x01",
        );
        let mut cb: SessionParserCallback = Default::default();
        crate::fix::decode::parse(&msg[..], &mut cb).unwrap();
        assert_eq!(cb.msg_type, b"A".to_vec());
        assert_eq!(cb.msg_seq_num, 1);
        assert_eq!(cb.sender_comp_id, Some(&b"Client"[..]));
        assert_eq!(cb.target_comp_id, Some(&b"Server"[..]));
        assert_eq!(cb.encrypt_method, Some(0));
        assert_eq!(cb.heart_bt_int, Some(30));
        assert_eq!(cb.reset_seq_num_flag, Some('Y'));
        assert!(cb.sending_time.is_some());
    }

    #[test]
    fn test_session_parser_callback_skips_app_body() {
        let msg = frame(
            "35=D\x0134=2\x0149=Client\x0152=20240506-13:59:15.021\x0156=Server\x0111=order-123\x0155=IBM\x01",
        );
        let mut cb: SessionParserCallback = Default::default();
        crate::fix::decode::parse(&msg[..], &mut cb).unwrap();
        assert_eq!(cb.msg_type, b"D".to_vec());
        assert_eq!(cb.msg_seq_num, 2);
        // body parsing stops for application messages
        assert!(cb.test_req_id.is_none());
    }

    #[test]
    fn test_session_parser_callback_multibyte_type() {
        let msg = frame(
            "35=BAD\x0134=2\x0149=Client\x0152=20240506-13:59:15.021\x0156=Server\x01",
        );
        let mut cb: SessionParserCallback = Default::default();
        crate::fix::decode::parse(&msg[..], &mut cb).unwrap();
        assert_eq!(cb.msg_type, b"BAD".to_vec());
    }

    #[tokio::test]
    async fn test_resend_collapses_admin_runs() {
        let envelope = EnvelopeHeaders::new("Client", "Server");
        let app = |seq: u32| {
            frame(&format!(
                "35=D\x0134={}\x0149=Client\x0152=20240506-13:59:15.021\x0156=Server\x0111=order-{}\x01",
                seq, seq
            ))
        };
        let admin = |seq: u32| {
            frame(&format!(
                "35=0\x0134={}\x0149=Client\x0152=20240506-13:59:15.021\x0156=Server\x01",
                seq
            ))
        };
        let messages = vec![(2u32, app(2)), (3, admin(3)), (4, admin(4)), (5, app(5))];

        let mut sink: Vec<u8> = Vec::new();
        resend_messages(messages, &mut sink, Some(&envelope), "FIX.4.4", None)
            .await
            .unwrap();

        let text = String::from_utf8_lossy(&sink);
        // the replayed orders carry PossDupFlag and OrigSendingTime
        assert!(text.contains("11=order-2"));
        assert!(text.contains("11=order-5"));
        assert!(text.contains("43=Y"));
        assert!(text.contains("122=20240506-13:59:15.021"));
        // the heartbeat run became one gap fill advancing to 5
        assert!(text.contains("35=4"));
        assert!(text.contains("123=Y"));
        assert!(text.contains("36=5"));
    }

    #[tokio::test]
    async fn test_resend_trailing_admin_run_gap_fills() {
        let envelope = EnvelopeHeaders::new("Client", "Server");
        let admin = frame("35=0\x0134=6\x0149=Client\x0152=20240506-13:59:15.021\x0156=Server\x01");
        let mut sink: Vec<u8> = Vec::new();
        resend_messages(vec![(6, admin)], &mut sink, Some(&envelope), "FIX.4.4", None)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&sink);
        assert!(text.contains("35=4"));
        assert!(text.contains("36=7"));
    }
}
