//! Per-operator session: the order round-trip state machine and the values
//! that live for one form-to-confirmation cycle.
//!
//! State changes go through [`transition`], a pure `(state, event) → state`
//! function. [`Session`] is the context object the submission handler
//! borrows mutably; nothing about a session is global.

use crate::captcha::Captcha;
use crate::order::Order;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an order round-trip currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing entered yet.
    #[default]
    Idle,
    /// The operator has entered (or is correcting) form values.
    FormFilled,
    /// Captcha and required fields are being checked.
    Validating,
    /// Remote and local image work is running.
    Processing,
    /// Result shown; only a new order leaves this state.
    Published,
    /// Processing failed; editing the form returns to `FormFilled`.
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::FormFilled => "form-filled",
            SessionState::Validating => "validating",
            SessionState::Processing => "processing",
            SessionState::Published => "published",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    FormEdited,
    Submit,
    ValidationPassed,
    ValidationFailed,
    ProcessingSucceeded,
    ProcessingFailed,
    NewOrder,
}

/// Pure reducer for the session state machine.
///
/// Pairs without a defined transition leave the state unchanged.
pub fn transition(state: SessionState, event: SessionEvent) -> SessionState {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Idle | S::FormFilled | S::Error, E::FormEdited) => S::FormFilled,
        (S::FormFilled | S::Error, E::Submit) => S::Validating,
        (S::Validating, E::ValidationPassed) => S::Processing,
        (S::Validating, E::ValidationFailed) => S::FormFilled,
        (S::Processing, E::ProcessingSucceeded) => S::Published,
        (S::Processing, E::ProcessingFailed) => S::Error,
        (S::Idle | S::FormFilled | S::Published | S::Error, E::NewOrder) => S::Idle,
        (s, _) => s,
    }
}

/// The finished image held for display and download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedImage {
    pub png: Bytes,
    pub filename: String,
    pub width: u32,
    pub height: u32,
}

/// One operator's order round-trip.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    captcha: Captcha,
    order: Option<Order>,
    result: Option<FinishedImage>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A fresh session with a newly drawn captcha.
    pub fn new() -> Self {
        Self::with_captcha(Captcha::generate())
    }

    pub fn with_captcha(captcha: Captcha) -> Self {
        Self {
            state: SessionState::Idle,
            captcha,
            order: None,
            result: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn captcha(&self) -> &Captcha {
        &self.captcha
    }

    pub fn order(&self) -> Option<&Order> {
        self.order.as_ref()
    }

    pub fn result(&self) -> Option<&FinishedImage> {
        self.result.as_ref()
    }

    /// Feed an event through [`transition`] and return the new state.
    pub fn apply(&mut self, event: SessionEvent) -> SessionState {
        let next = transition(self.state, event);
        if next != self.state {
            tracing::debug!(from = %self.state, to = %next, ?event, "session transition");
        }
        self.state = next;
        next
    }

    /// Whether a new submission may start from the current state.
    pub fn can_submit(&self) -> bool {
        transition(self.state, SessionEvent::Submit) == SessionState::Validating
    }

    pub(crate) fn record_success(&mut self, order: Order, image: FinishedImage) {
        self.order = Some(order);
        self.result = Some(image);
        self.apply(SessionEvent::ProcessingSucceeded);
    }

    /// Start a new order: drop the result and order and draw a new captcha.
    ///
    /// Every field is replaced in one assignment, so no caller can observe a
    /// half-reset session.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderForm;
    use SessionEvent as E;
    use SessionState as S;

    #[test]
    fn happy_path() {
        let mut s = S::Idle;
        for (event, expected) in [
            (E::FormEdited, S::FormFilled),
            (E::Submit, S::Validating),
            (E::ValidationPassed, S::Processing),
            (E::ProcessingSucceeded, S::Published),
            (E::NewOrder, S::Idle),
        ] {
            s = transition(s, event);
            assert_eq!(s, expected, "after {event:?}");
        }
    }

    #[test]
    fn validation_failure_returns_to_form() {
        assert_eq!(transition(S::Validating, E::ValidationFailed), S::FormFilled);
    }

    #[test]
    fn processing_failure_allows_retry() {
        let s = transition(S::Processing, E::ProcessingFailed);
        assert_eq!(s, S::Error);
        assert_eq!(transition(s, E::FormEdited), S::FormFilled);
        assert_eq!(transition(s, E::Submit), S::Validating);
    }

    #[test]
    fn published_only_leaves_through_new_order() {
        for event in [
            E::FormEdited,
            E::Submit,
            E::ValidationPassed,
            E::ValidationFailed,
            E::ProcessingSucceeded,
            E::ProcessingFailed,
        ] {
            assert_eq!(transition(S::Published, event), S::Published, "{event:?}");
        }
        assert_eq!(transition(S::Published, E::NewOrder), S::Idle);
    }

    #[test]
    fn processing_ignores_new_order() {
        assert_eq!(transition(S::Processing, E::NewOrder), S::Processing);
        assert_eq!(transition(S::Processing, E::Submit), S::Processing);
    }

    #[test]
    fn reset_clears_everything() {
        let mut session = Session::new();
        session.apply(E::FormEdited);
        session.apply(E::Submit);
        session.apply(E::ValidationPassed);
        let order = OrderForm {
            customer_name: "Ana".into(),
            amount: "10".into(),
            ..Default::default()
        }
        .validate()
        .unwrap();
        session.record_success(
            order,
            FinishedImage {
                png: Bytes::from_static(b"png"),
                filename: "ela_ana.png".into(),
                width: 1,
                height: 1,
            },
        );
        assert_eq!(session.state(), S::Published);
        assert!(!session.can_submit());
        let old_id = session.captcha().id();

        session.reset();
        assert_eq!(session.state(), S::Idle);
        assert!(session.order().is_none());
        assert!(session.result().is_none());
        assert_ne!(session.captcha().id(), old_id);
    }
}
