//! Правило подписки: активность и продление.
//!
//! Единственное правило, которому обязаны следовать все пути продления
//! (покупка, промокод, ручная правка админом): новый срок считается от
//! большего из «сейчас» и текущего конца подписки, оставшиеся дни не
//! сгорают.

pub const DAY_SECS: i64 = 86_400;

/// Активна ли подписка в момент `now` (unix-секунды).
pub fn is_active(subscription_end: Option<i64>, now: i64) -> bool {
    subscription_end.is_some_and(|end| end > now)
}

/// Новый конец подписки после продления на `add_secs` секунд.
pub fn extend(subscription_end: Option<i64>, now: i64, add_secs: i64) -> i64 {
    subscription_end.unwrap_or(0).max(now) + add_secs
}

pub fn days_to_secs(days: i64) -> i64 {
    days * DAY_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn no_subscription_is_inactive() {
        assert!(!is_active(None, NOW));
    }

    #[test]
    fn past_end_is_inactive() {
        assert!(!is_active(Some(NOW - 1), NOW));
        assert!(!is_active(Some(NOW), NOW));
    }

    #[test]
    fn future_end_is_active() {
        assert!(is_active(Some(NOW + 1), NOW));
    }

    #[test]
    fn extension_of_expired_subscription_starts_from_now() {
        let end = extend(Some(NOW - DAY_SECS), NOW, days_to_secs(7));
        assert_eq!(end, NOW + days_to_secs(7));
    }

    #[test]
    fn extension_without_subscription_starts_from_now() {
        let end = extend(None, NOW, days_to_secs(7));
        assert_eq!(end, NOW + days_to_secs(7));
    }

    #[test]
    fn extension_of_active_subscription_stacks() {
        let current = NOW + days_to_secs(10);
        let end = extend(Some(current), NOW, days_to_secs(3));
        assert_eq!(end, current + days_to_secs(3));
    }
}
