//! Arithmetic captcha gating order submission.
//!
//! A challenge is two small operands plus a random id. The id travels with
//! the answer, so a sum worked out for a challenge that has since been
//! replaced is refused even when the new operands happen to add up to the
//! same value.

use crate::error::FormError;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Operand range, inclusive on both ends.
pub const OPERAND_MIN: u8 = 1;
pub const OPERAND_MAX: u8 = 9;

/// A generated challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Captcha {
    id: u64,
    a: u8,
    b: u8,
}

/// What the operator typed, bound to the challenge it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaAnswer {
    pub challenge_id: u64,
    pub value: i64,
}

impl Captcha {
    /// Draw a fresh challenge from the thread-local RNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    /// Draw a fresh challenge from the given RNG.
    pub fn generate_with<R: Rng>(rng: &mut R) -> Self {
        Self {
            id: rng.random(),
            a: rng.random_range(OPERAND_MIN..=OPERAND_MAX),
            b: rng.random_range(OPERAND_MIN..=OPERAND_MAX),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn operands(&self) -> (u8, u8) {
        (self.a, self.b)
    }

    /// The question shown next to the answer field.
    pub fn question(&self) -> String {
        format!("How much is {} + {}?", self.a, self.b)
    }

    /// Bind a typed value to this challenge.
    pub fn answer(&self, value: i64) -> CaptchaAnswer {
        CaptchaAnswer {
            challenge_id: self.id,
            value,
        }
    }

    /// Accept only the sum of this challenge's operands.
    pub fn check(&self, answer: &CaptchaAnswer) -> Result<(), FormError> {
        if answer.challenge_id != self.id {
            return Err(FormError::StaleCaptcha);
        }
        if answer.value != i64::from(self.a) + i64::from(self.b) {
            return Err(FormError::WrongCaptcha);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn operands_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let (a, b) = Captcha::generate_with(&mut rng).operands();
            assert!((OPERAND_MIN..=OPERAND_MAX).contains(&a));
            assert!((OPERAND_MIN..=OPERAND_MAX).contains(&b));
        }
    }

    #[test]
    fn accepts_only_the_sum() {
        let c = Captcha::generate();
        let (a, b) = c.operands();
        let sum = i64::from(a) + i64::from(b);
        assert!(c.check(&c.answer(sum)).is_ok());
        for wrong in [sum - 1, sum + 1, 0, -sum, i64::MAX] {
            assert_eq!(c.check(&c.answer(wrong)), Err(FormError::WrongCaptcha));
        }
    }

    #[test]
    fn previous_challenge_answer_is_rejected() {
        let mut rng = StdRng::seed_from_u64(99);
        let old = Captcha::generate_with(&mut rng);
        let (a, b) = old.operands();
        let old_answer = old.answer(i64::from(a) + i64::from(b));

        let new = Captcha::generate_with(&mut rng);
        assert_ne!(old.id(), new.id());
        assert_eq!(new.check(&old_answer), Err(FormError::StaleCaptcha));
    }

    #[test]
    fn question_mentions_operands() {
        let c = Captcha { id: 1, a: 3, b: 4 };
        assert_eq!(c.question(), "How much is 3 + 4?");
    }
}
