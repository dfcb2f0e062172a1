//! Session timers.
//!
//! Three clocks run against a FIX connection: a heartbeat is owed after
//! `HeartBtInt` of send inactivity, a TestRequest goes out after 1.7x of
//! receive inactivity, and a sent Logout may only wait so long for its
//! reply. The session loop asks for the next deadline each iteration and
//! feeds the fired timer back into the state machine.

use crate::fix::session::Event;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TimerKind {
    Heartbeat,
    TestRequest,
    LogoutExpired,
}

impl TimerKind {
    pub(super) fn into_event(self) -> Event {
        match self {
            TimerKind::Heartbeat => Event::SendHeartbeat,
            TimerKind::TestRequest => Event::SendTestRequest,
            TimerKind::LogoutExpired => Event::LogoutExpired,
        }
    }
}

struct Deadline {
    at: Instant,
    period: Duration,
}

impl Deadline {
    fn new(period: Duration) -> Deadline {
        Deadline {
            at: Instant::now() + period,
            period,
        }
    }
    fn reset(&mut self) {
        self.at = Instant::now() + self.period;
    }
    fn set_period(&mut self, period: Duration) {
        self.period = period;
        self.reset();
    }
}

pub(super) struct FixTimeouts {
    heartbeat: Deadline,
    test_request: Deadline,
    logout: Deadline,
    awaiting_logout: bool,
}

impl FixTimeouts {
    pub(super) fn new(
        heartbeat_dur: Duration,
        test_request_dur: Duration,
        logout_dur: Duration,
    ) -> FixTimeouts {
        FixTimeouts {
            heartbeat: Deadline::new(heartbeat_dur),
            test_request: Deadline::new(test_request_dur),
            logout: Deadline::new(logout_dur),
            awaiting_logout: false,
        }
    }

    /// The next deadline to arm the session loop's sleep with. While a sent
    /// Logout is outstanding only the logout clock matters.
    pub(super) fn next_deadline(&self) -> (Instant, TimerKind) {
        if self.awaiting_logout {
            (self.logout.at, TimerKind::LogoutExpired)
        } else if self.heartbeat.at < self.test_request.at {
            (self.heartbeat.at, TimerKind::Heartbeat)
        } else {
            (self.test_request.at, TimerKind::TestRequest)
        }
    }

    /// Re-arm a timer that just fired so the loop does not spin on it.
    pub(super) fn mark_fired(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Heartbeat => self.heartbeat.reset(),
            TimerKind::TestRequest => self.test_request.reset(),
            TimerKind::LogoutExpired => self.logout.reset(),
        }
    }

    pub(super) fn reset_heartbeat(&mut self) {
        self.heartbeat.reset();
    }

    pub(super) fn reset_test_request(&mut self) {
        self.test_request.reset();
    }

    pub(super) fn start_logout_timeout(&mut self) {
        self.awaiting_logout = true;
        self.logout.reset();
    }

    /// Adopt the intervals agreed during logon.
    pub(super) fn set_durations(
        &mut self,
        heartbeat_dur: Duration,
        test_request_dur: Duration,
        logout_dur: Duration,
    ) {
        self.heartbeat.set_period(heartbeat_dur);
        self.test_request.set_period(test_request_dur);
        self.logout.set_period(logout_dur);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_next_deadline_ordering() {
        let mut t = FixTimeouts::new(
            Duration::from_secs(30),
            Duration::from_secs(51),
            Duration::from_secs(60),
        );
        let (_, kind) = t.next_deadline();
        assert_eq!(kind, TimerKind::Heartbeat);

        // heartbeat pushed out beyond the test request
        t.heartbeat.at = Instant::now() + Duration::from_secs(100);
        let (_, kind) = t.next_deadline();
        assert_eq!(kind, TimerKind::TestRequest);

        t.start_logout_timeout();
        let (_, kind) = t.next_deadline();
        assert_eq!(kind, TimerKind::LogoutExpired);
    }

    #[tokio::test]
    async fn test_mark_fired_re_arms() {
        let mut t = FixTimeouts::new(
            Duration::from_millis(1),
            Duration::from_secs(51),
            Duration::from_secs(60),
        );
        let (before, kind) = t.next_deadline();
        assert_eq!(kind, TimerKind::Heartbeat);
        tokio::time::sleep(Duration::from_millis(2)).await;
        t.mark_fired(TimerKind::Heartbeat);
        let (after, _) = t.next_deadline();
        assert!(after > before);
    }
}
