use uuid::Uuid;

/// Time-ordered id for locally created entities.
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Random token the remote service uses to recognise replays of one action.
pub fn new_idempotency_key() -> String {
    Uuid::new_v4().to_string()
}
