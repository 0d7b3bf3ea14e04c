#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("identity error: {0}")]
    Identity(String),
    #[error("lock contention on fingerprint {0}: retries exhausted")]
    LockContention(String),
    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_their_context() {
        let err = LedgerError::Identity("no identity-bearing fields".to_string());
        assert_eq!(err.to_string(), "identity error: no identity-bearing fields");
        let err = LedgerError::LockContention("host:ip:10.0.0.5".to_string());
        assert_eq!(
            err.to_string(),
            "lock contention on fingerprint host:ip:10.0.0.5: retries exhausted"
        );
    }
}
