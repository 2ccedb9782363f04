use crate::value::Timestamp;

/// Gets the current wall-clock time as seconds since the UNIX epoch
pub fn unix_timestamp() -> Timestamp {
    let now = std::time::SystemTime::now();

    // NOTE: Unwrap is trivial
    #[allow(clippy::unwrap_used)]
    now.duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}
