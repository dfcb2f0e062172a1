use crate::fix::encode::{MessageBuilder, SerializedInt};
use crate::fix::fields::{GapFillFlag, MsgType, PossDupFlag, SessionRejectReason, Tags};
use crate::fix::log::{LogLevel, Logger};
use crate::fix::{GarbledMessageType, SessionError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

enum Response {
    Handled,
    Transition(State),
}

#[derive(Debug, Clone)]
pub(crate) enum State {
    Start,
    AwaitingLogon,
    LogonSent,
    LoggedIn,
    ExpectingResends { return_state: Arc<State> },
    ExpectingTestResponse,
    LogoutSent,
    End,
    Error,
}

/// The per-session protocol state machine. Events come from three places:
/// parsed inbound messages, caller requests, and the session timers. State
/// transitions may queue outbound messages on the outbox; the session loop
/// drains it after every event.
pub(crate) struct SessionMachine {
    pub(crate) outbox: VecDeque<(MessageBuilder, Option<oneshot::Sender<bool>>)>,
    pub(crate) sequences: Arc<Sequences>,
    pub(crate) begin_string: Arc<String>,
    heartbeat_secs: u32,
    username: Option<String>,
    password: Option<String>,
    logger: Arc<dyn Logger>,
    rereceive_range: Option<(u32, u32)>,
    logout_resp_sender: Option<oneshot::Sender<bool>>,
    logon_resp_sender: Option<oneshot::Sender<bool>>,
    state: State,
}

#[derive(Debug)]
pub(crate) enum Event {
    Connect,
    Accept,
    LogonReceived(u32, u32, Option<u32>, bool, Option<PossDupFlag>),
    LogoutSent,
    LogoutReceived(u32, Option<PossDupFlag>),
    HeartbeatReceived(u32, Option<PossDupFlag>),
    SequenceResetReceived {
        msg_seq_num: u32,
        gap_fill: Option<GapFillFlag>,
        new_seq_no: u32,
        poss_dup: Option<PossDupFlag>,
    },
    TestRequestReceived {
        msg_seq_num: u32,
        test_req_id: Vec<u8>,
        poss_dup: Option<PossDupFlag>,
    },
    SessionErrorReceived {
        error: SessionError,
    },
    ApplicationMessageReceived(u32, Option<PossDupFlag>),
    SendHeartbeat,
    SendTestRequest,
    ResendRequestReceived(u32, u32, u32, Option<PossDupFlag>),
    RejectReceived(u32, Option<PossDupFlag>),
    LogoutExpired,
}

impl Event {
    fn get_msg_seq_num(&self) -> Option<u32> {
        match self {
            Event::LogonReceived(n, ..) => Some(*n),
            Event::LogoutReceived(n, ..) => Some(*n),
            Event::HeartbeatReceived(n, ..) => Some(*n),
            Event::SequenceResetReceived {
                msg_seq_num,
                gap_fill: Some(GapFillFlag::YES),
                ..
            } => Some(*msg_seq_num),
            Event::TestRequestReceived { msg_seq_num, .. } => Some(*msg_seq_num),
            Event::ApplicationMessageReceived(n, ..) => Some(*n),
            Event::ResendRequestReceived(n, ..) => Some(*n),
            Event::RejectReceived(n, ..) => Some(*n),
            _ => None,
        }
    }

    fn is_poss_dup(&self) -> bool {
        let poss_dup_flag = match self {
            Event::LogonReceived(.., p) => p,
            Event::LogoutReceived(.., p) => p,
            Event::HeartbeatReceived(.., p) => p,
            Event::SequenceResetReceived { poss_dup, .. } => poss_dup,
            Event::TestRequestReceived { poss_dup, .. } => poss_dup,
            Event::ApplicationMessageReceived(.., p) => p,
            Event::ResendRequestReceived(.., p) => p,
            Event::RejectReceived(.., p) => p,
            _ => &None,
        };
        poss_dup_flag == &Some(PossDupFlag::YES)
    }

    fn is_logout(&self) -> bool {
        matches!(self, Event::LogoutReceived(..))
    }
}

fn is_fatal_reject(reason: &Option<SessionRejectReason>) -> bool {
    matches!(
        reason,
        Some(SessionRejectReason::COMPID_PROBLEM)
            | Some(SessionRejectReason::SENDINGTIME_ACCURACY_PROBLEM)
            | Some(SessionRejectReason::INVALID_MSGTYPE)
    )
}

impl SessionMachine {
    pub(crate) fn new(
        begin_string: Arc<String>,
        heartbeat_secs: u32,
        username: Option<String>,
        password: Option<String>,
        logger: Arc<dyn Logger>,
        sequences: Arc<Sequences>,
    ) -> Self {
        SessionMachine {
            outbox: VecDeque::new(),
            sequences,
            begin_string,
            heartbeat_secs,
            username,
            password,
            logger,
            logon_resp_sender: None,
            logout_resp_sender: None,
            rereceive_range: None,
            state: State::Start,
        }
    }
    pub(crate) fn state(&self) -> &State {
        &self.state
    }
    pub(crate) fn handle(&mut self, event: &Event) {
        if let Response::Transition(new_state) = match &self.state {
            State::Start => self.start(event),
            State::AwaitingLogon => self.awaiting_logon(event),
            State::LogonSent => self.logon_sent(event),
            State::LoggedIn => self.logged_in(event),
            State::ExpectingResends { return_state } => {
                self.expecting_resends(event, return_state.clone())
            }
            State::ExpectingTestResponse => self.expecting_test_response(event),
            State::LogoutSent => self.logout_sent(event),
            State::End => self.end(event),
            State::Error => self.error(event),
        } {
            self.state = new_state;
        }
    }
    pub(crate) fn outbox_push(&mut self, builder: MessageBuilder) {
        self.outbox.push_back((builder, None));
    }
    pub(crate) fn outbox_push_with_sender(
        &mut self,
        builder: MessageBuilder,
        resp_sender: oneshot::Sender<bool>,
    ) {
        self.outbox.push_back((builder, Some(resp_sender)));
    }
    pub(crate) fn outbox_pop(&mut self) -> Option<(MessageBuilder, Option<oneshot::Sender<bool>>)> {
        self.outbox.pop_front()
    }
    pub(crate) fn outbox_clear(&mut self) {
        self.outbox.clear();
    }
    pub(crate) fn set_logon_resp_sender(&mut self, resp_sender: Option<oneshot::Sender<bool>>) {
        self.logon_resp_sender = resp_sender;
    }
    pub(crate) fn set_logout_resp_sender(&mut self, resp_sender: Option<oneshot::Sender<bool>>) {
        self.logout_resp_sender = resp_sender;
    }
    fn send_logon_response(&mut self, logon_status: bool) {
        if let Some(resp_sender) = self.logon_resp_sender.take() {
            let _ = resp_sender.send(logon_status);
        }
    }
    pub(crate) fn send_logout_response(&mut self, logout_status: bool) {
        if let Some(resp_sender) = self.logout_resp_sender.take() {
            let _ = resp_sender.send(logout_status);
        }
    }

    /// Sequence discipline for any event that carries a `MsgSeqNum(34)`:
    /// in order is accepted, a gap opens a resend window, the previous
    /// number is a tolerated duplicate, and anything older kills the
    /// session.
    fn process_sequence(&mut self, event: &Event, return_state: State) -> Option<Response> {
        event.get_msg_seq_num().and_then(|incoming| {
            let expected = self.sequences.peek_incoming();
            if expected == incoming {
                self.sequences.incr_incoming();
                None
            } else if expected < incoming {
                self.rereceive_range = Some((expected, incoming));
                let message =
                    MessageBuilder::new(&self.begin_string, MsgType::RESEND_REQUEST.into())
                        .push(Tags::BeginSeqNo, SerializedInt::from(expected).as_bytes())
                        .push(Tags::EndSeqNo, SerializedInt::from(0u32).as_bytes());
                self.outbox_push(message);
                Some(Response::Transition(State::ExpectingResends {
                    return_state: Arc::new(return_state),
                }))
            } else if incoming + 1 == expected {
                if self.logger.enabled(LogLevel::Warn) {
                    self.logger.log(
                        LogLevel::Warn,
                        &format!(
                            "duplicate MsgSeqNum {} received, expecting {}",
                            incoming, expected
                        ),
                    );
                }
                Some(Response::Handled)
            } else if !event.is_poss_dup() {
                let text = format!(
                    "MsgSeqNum too low, expecting {} but received {}",
                    expected, incoming
                );
                self.outbox_push(build_message_reject(
                    &self.begin_string,
                    &text,
                    &Some(SessionRejectReason::VALUE_IS_INCORRECT),
                    &incoming,
                    &Some(Tags::MsgSeqNum.into()),
                    &None,
                ));
                self.outbox_push(build_logout_message_with_text(
                    &self.begin_string,
                    text.as_bytes(),
                ));
                Some(Response::Transition(State::Error))
            } else {
                Some(Response::Handled)
            }
        })
    }
    fn reset_sequences(&mut self) {
        self.sequences.reset();
    }
    fn reset_expected_incoming(&mut self, msg_seq_num: u32, new_seq_no: u32) {
        match self.sequences.reset_incoming(new_seq_no) {
            Ok(_) => {}
            Err(msg) => {
                let builder = build_message_reject(
                    &self.begin_string,
                    msg,
                    &Some(SessionRejectReason::VALUE_IS_INCORRECT),
                    &msg_seq_num,
                    &Some(Tags::NewSeqNo.into()),
                    &Some(char::from(MsgType::SEQUENCE_RESET).to_string()),
                );
                self.outbox_push(builder);
            }
        }
    }

    /// An inbound message was rejected by validation. The expected incoming
    /// sequence still advances past the offender, the Reject goes on the
    /// wire, and CompID / SendingTime / MsgType problems additionally end
    /// the session with a Logout carrying the same text.
    fn reject_received_message(
        &mut self,
        text: &str,
        reject_reason: &Option<SessionRejectReason>,
        msg_seq_num: &u32,
        ref_tag_id: &Option<u32>,
        ref_msg_type: &Option<String>,
    ) -> Response {
        self.sequences.force_incoming(msg_seq_num + 1);
        self.outbox_push(build_message_reject(
            &self.begin_string,
            text,
            reject_reason,
            msg_seq_num,
            ref_tag_id,
            ref_msg_type,
        ));
        if is_fatal_reject(reject_reason) {
            self.outbox_push(build_logout_message_with_text(
                &self.begin_string,
                text.as_bytes(),
            ));
            return Response::Transition(State::Error);
        }
        Response::Handled
    }

    // This function acts as a superstate: multiple states defer execution to
    // it for the events they share.
    fn post_logon(&mut self, event: &Event) -> Response {
        match event {
            Event::SessionErrorReceived {
                error:
                    SessionError::GarbledMessage {
                        text,
                        garbled_msg_type: GarbledMessageType::BeginStringIssue,
                    },
            } => {
                self.outbox_push(build_logout_message_with_text(
                    &self.begin_string,
                    text.as_bytes(),
                ));
                Response::Transition(State::Error)
            }
            Event::SessionErrorReceived {
                error: SessionError::TcpDisconnection,
            } => Response::Transition(State::Error),
            Event::LogoutReceived(..) => {
                let builder = build_logout_message(&self.begin_string);
                self.outbox_push(builder);
                Response::Transition(State::End)
            }
            Event::SendTestRequest => {
                let builder = MessageBuilder::new(&self.begin_string, MsgType::TEST_REQUEST.into())
                    .push(Tags::TestReqID, b"TEST");
                self.outbox_push(builder);
                Response::Transition(State::ExpectingTestResponse)
            }
            Event::SendHeartbeat => {
                let builder = MessageBuilder::new(&self.begin_string, MsgType::HEARTBEAT.into());
                self.outbox_push(builder);
                Response::Handled
            }
            Event::LogoutSent => Response::Transition(State::LogoutSent),
            Event::LogoutExpired => Response::Transition(State::Error),
            _ => Response::Handled,
        }
    }
    fn expecting_resends(&mut self, event: &Event, return_state: Arc<State>) -> Response {
        let (next, end) = match self.rereceive_range.as_mut() {
            Some(v) => v,
            None => return Response::Transition(State::Error),
        };

        if !event.is_poss_dup() {
            if matches!(event, Event::LogoutReceived(..)) {
                let message = build_logout_message(&self.begin_string);
                self.outbox_push(message);
                return Response::Transition(State::End);
            } else {
                return self.post_logon(event);
            }
        };

        if let Event::SequenceResetReceived {
            gap_fill: Some(GapFillFlag::NO) | None,
            msg_seq_num,
            new_seq_no,
            ..
        } = event
        {
            self.reset_expected_incoming(*msg_seq_num, *new_seq_no);
            return Response::Transition((*return_state).clone());
        }

        if event.get_msg_seq_num() != Some(*next) {
            return Response::Handled;
        }

        let next_seq_num = match event {
            Event::SequenceResetReceived { new_seq_no, .. } => *new_seq_no,
            _ => *next + 1,
        };

        *next = next_seq_num;
        if next > end {
            let _ = self.sequences.reset_incoming(*next);
            self.rereceive_range = None;
            if matches!(*return_state, State::End) {
                let message = build_logout_message(&self.begin_string);
                self.outbox_push(message);
            }
            return Response::Transition((*return_state).clone());
        }
        Response::Handled
    }

    fn expecting_test_response(&mut self, event: &Event) -> Response {
        match event {
            Event::HeartbeatReceived(..) => {
                if let Some(resp) = self.process_sequence(event, State::LoggedIn) {
                    return resp;
                }
                Response::Transition(State::LoggedIn)
            }
            Event::SendHeartbeat | Event::SendTestRequest => Response::Transition(State::Error),
            _ => self.logged_in(event),
        }
    }
    fn logged_in(&mut self, event: &Event) -> Response {
        let next_state = if event.is_logout() {
            State::End
        } else {
            State::LoggedIn
        };

        if let Some(resp) = self.process_sequence(event, next_state) {
            return resp;
        }
        match event {
            Event::SessionErrorReceived {
                error: SessionError::MissingMsgSeqNum { text },
            } => {
                self.outbox_push(build_logout_message_with_text(
                    &self.begin_string,
                    text.as_bytes(),
                ));
                Response::Transition(State::Error)
            }
            Event::SequenceResetReceived {
                msg_seq_num,
                new_seq_no,
                ..
            } => {
                self.reset_expected_incoming(*msg_seq_num, *new_seq_no);
                Response::Handled
            }
            Event::TestRequestReceived { test_req_id, .. } => {
                let builder: MessageBuilder =
                    MessageBuilder::new(&self.begin_string, MsgType::HEARTBEAT.into())
                        .push(Tags::TestReqID, test_req_id);
                self.outbox_push(builder);
                Response::Handled
            }
            Event::ApplicationMessageReceived(..) => Response::Handled,
            Event::SessionErrorReceived {
                error:
                    SessionError::MessageRejected {
                        text,
                        reject_reason,
                        msg_seq_num,
                        ref_tag_id,
                        ref_msg_type,
                    },
            } => self.reject_received_message(text, reject_reason, msg_seq_num, ref_tag_id, ref_msg_type),
            Event::SessionErrorReceived {
                error: SessionError::TcpDisconnection,
            } => Response::Transition(State::Error),
            _ => self.post_logon(event),
        }
    }
    fn start(&mut self, event: &Event) -> Response {
        match event {
            Event::Connect => {
                let mut builder: MessageBuilder =
                    MessageBuilder::new(&self.begin_string, MsgType::LOGON.into())
                        .push(Tags::EncryptMethod, b"0")
                        .push(
                            Tags::HeartBtInt,
                            SerializedInt::from(self.heartbeat_secs).as_bytes(),
                        )
                        .push(Tags::ResetSeqNumFlag, b"Y");
                if let Some(username) = &self.username {
                    builder = builder.push(Tags::Username, username.as_bytes());
                }
                if let Some(password) = &self.password {
                    builder = builder.push(Tags::Password, password.as_bytes());
                }
                self.reset_sequences();
                self.outbox_push(builder);
                Response::Transition(State::LogonSent)
            }
            Event::Accept => Response::Transition(State::AwaitingLogon),
            _ => Response::Handled,
        }
    }
    #[allow(unused_variables)]
    fn error(&mut self, event: &Event) -> Response {
        Response::Handled
    }
    #[allow(unused_variables)]
    fn end(&mut self, event: &Event) -> Response {
        Response::Handled
    }
    fn awaiting_logon(&mut self, event: &Event) -> Response {
        match event {
            Event::SessionErrorReceived { error } => match error {
                SessionError::MessageRejected {
                    text,
                    reject_reason,
                    msg_seq_num,
                    ref_tag_id,
                    ref_msg_type,
                } => {
                    // Violations on the very first frame still get answered
                    // on the wire before the session dies.
                    let resp = self.reject_received_message(
                        text,
                        reject_reason,
                        msg_seq_num,
                        ref_tag_id,
                        ref_msg_type,
                    );
                    self.send_logon_response(false);
                    match resp {
                        Response::Transition(state) => Response::Transition(state),
                        Response::Handled => Response::Transition(State::Error),
                    }
                }
                _ => {
                    self.send_logon_response(false);
                    Response::Transition(State::Error)
                }
            },
            Event::LogonReceived(_, heart_bt_int, maybe_encrypt_method, reset_seq_num, _) => {
                if *maybe_encrypt_method != Some(0) {
                    self.send_logon_response(false);
                    return Response::Transition(State::Error);
                }
                let mut builder: MessageBuilder =
                    MessageBuilder::new(&self.begin_string, MsgType::LOGON.into())
                        .push(Tags::EncryptMethod, b"0")
                        .push(
                            Tags::HeartBtInt,
                            SerializedInt::from(*heart_bt_int).as_bytes(),
                        );
                if *reset_seq_num {
                    builder = builder.push(Tags::ResetSeqNumFlag, b"Y");
                    self.reset_sequences();
                }
                self.outbox_push(builder);
                self.send_logon_response(true);
                if let Some(resp) = self.process_sequence(event, State::LoggedIn) {
                    return resp;
                }
                Response::Transition(State::LoggedIn)
            }
            _ => {
                self.send_logon_response(false);
                Response::Transition(State::Error)
            }
        }
    }
    fn logon_sent(&mut self, event: &Event) -> Response {
        match event {
            Event::LogonReceived(_, _, encrypt_method, _, _) => {
                if *encrypt_method != Some(0) {
                    return Response::Transition(State::Error);
                }
                self.send_logon_response(true);

                if let Some(resp) = self.process_sequence(event, State::LoggedIn) {
                    return resp;
                }

                Response::Transition(State::LoggedIn)
            }
            Event::SessionErrorReceived { error } => {
                match error {
                    SessionError::MessageRejected { ref_msg_type, .. }
                        if ref_msg_type.as_deref() == Some("A") =>
                    {
                        let builder = build_logout_message(&self.begin_string);
                        self.outbox_push(builder);
                    }
                    _ => {}
                }

                self.send_logon_response(false);
                Response::Transition(State::Error)
            }
            Event::LogoutSent => {
                self.send_logon_response(false);
                Response::Transition(State::LogoutSent)
            }
            _ => {
                self.send_logon_response(false);
                Response::Transition(State::Error)
            }
        }
    }
    fn logout_sent(&mut self, event: &Event) -> Response {
        if let Some(resp) = self.process_sequence(event, State::LogoutSent) {
            return resp;
        }

        match event {
            Event::LogoutReceived(..) => Response::Transition(State::End),
            Event::LogoutExpired => Response::Transition(State::Error),
            Event::SessionErrorReceived { .. }
            | Event::SendTestRequest
            | Event::SendHeartbeat => Response::Transition(State::Error),
            _ => Response::Handled,
        }
    }
}

pub(crate) fn should_pass_app_message(state_machine: &SessionMachine, msg_seq_num: u32) -> bool {
    if let Some((next, _)) = state_machine.rereceive_range {
        return msg_seq_num == next;
    }
    msg_seq_num == state_machine.sequences.peek_incoming()
        && !matches!(
            state_machine.state(),
            State::Start {}
                | State::End {}
                | State::Error {}
                | State::AwaitingLogon {}
                | State::LogonSent {}
        )
}

pub(crate) fn should_resend(state_machine: &SessionMachine) -> bool {
    matches!(
        state_machine.state(),
        State::LoggedIn | State::ExpectingResends { .. } | State::LogoutSent
    )
}
pub(crate) fn should_disconnect(state_machine: &SessionMachine) -> bool {
    matches!(state_machine.state(), State::End | State::Error)
}

pub(crate) fn in_error_state(state_machine: &SessionMachine) -> bool {
    matches!(state_machine.state(), State::Error)
}

pub(crate) fn build_logout_message_with_text(begin_string: &str, text: &[u8]) -> MessageBuilder {
    MessageBuilder::new(begin_string, MsgType::LOGOUT.into()).push(Tags::Text, text)
}

pub(crate) fn build_logout_message(begin_string: &str) -> MessageBuilder {
    MessageBuilder::new(begin_string, MsgType::LOGOUT.into())
}

fn build_message_reject(
    begin_string: &str,
    text: &str,
    reject_reason: &Option<SessionRejectReason>,
    msg_seq_num: &u32,
    ref_tag_id: &Option<u32>,
    ref_msg_type: &Option<String>,
) -> MessageBuilder {
    let mut builder: MessageBuilder = MessageBuilder::new(begin_string, MsgType::REJECT.into())
        .push(
            Tags::RefSeqNum,
            SerializedInt::from(*msg_seq_num).as_bytes(),
        )
        .push(Tags::Text, text.as_bytes());

    if let Some(t) = ref_tag_id {
        builder = builder.push(Tags::RefTagID, SerializedInt::from(*t).as_bytes());
    }
    if let Some(mt) = ref_msg_type {
        builder = builder.push(Tags::RefMsgType, mt.as_bytes());
    }
    if let Some(r) = reject_reason {
        builder = builder.push(
            Tags::SessionRejectReason,
            SerializedInt::from(<&SessionRejectReason as Into<u32>>::into(r)).as_bytes(),
        );
    }
    builder
}

/// Next-to-assign sequence counters: `.0` outgoing, `.1` incoming. Shared
/// between the session task (which assigns and advances) and caller-facing
/// handles (which read); plain 32-bit atomic reads are accepted best-effort.
#[derive(Default, Debug)]
pub struct Sequences(AtomicU32, AtomicU32);

impl Sequences {
    pub(crate) fn next_outgoing(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
    pub(crate) fn incr_incoming(&self) -> u32 {
        self.1.fetch_add(1, Ordering::Relaxed)
    }
    pub fn peek_incoming(&self) -> u32 {
        self.1.load(Ordering::Relaxed)
    }
    pub fn peek_outgoing(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
    pub(crate) fn reset_incoming(&self, new: u32) -> std::result::Result<(), &'static str> {
        let old = self.1.fetch_max(new, Ordering::Relaxed);
        if old > new {
            Err("Value is incorrect (out of range) for this tag")
        } else {
            Ok(())
        }
    }
    /// Advance the expected incoming sequence, never moving it backwards.
    pub(crate) fn force_incoming(&self, new: u32) {
        self.1.fetch_max(new, Ordering::Relaxed);
    }
    pub(crate) fn reset(&self) {
        self.0.store(1, Ordering::Relaxed);
        self.1.store(1, Ordering::Relaxed);
    }
}

impl From<(u32, u32)> for Sequences {
    fn from((incoming, outgoing): (u32, u32)) -> Self {
        Sequences(outgoing.into(), incoming.into())
    }
}
