use chrono::Utc;

/// Wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_follows_the_system_clock() {
        let before = Utc::now().timestamp_millis();
        let now = now_ms();
        assert!(now >= before);
        assert!(now - before < 60_000);
    }
}
