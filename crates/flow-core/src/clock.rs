//! Reloj inyectable. Los coordinadores nunca llaman a `Utc::now()` directo:
//! en tests se usa `ManualClock` para fijar `computedAt`/`lastValidated`.
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reloj lógico controlado por el test. Clonar comparte el mismo instante.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Devuelve `now` salvo que sea anterior a `floor`. Garantiza marcas de
/// tiempo no decrecientes por clave aunque el reloj retroceda.
pub fn not_before(now: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match floor {
        Some(f) if f > now => f,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let c = ManualClock::default();
        let c2 = c.clone();
        c.advance(chrono::Duration::seconds(5));
        assert_eq!(c2.now(), DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(5));
    }

    #[test]
    fn not_before_clamps_backwards_clock() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let t1 = t0 + chrono::Duration::seconds(1);
        assert_eq!(not_before(t0, Some(t1)), t1);
        assert_eq!(not_before(t1, Some(t0)), t1);
        assert_eq!(not_before(t0, None), t0);
    }
}
