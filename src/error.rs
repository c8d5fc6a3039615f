/// Logs and discards an error, keeping the success value.
///
/// The scrape and supervision paths treat most failures as per-target:
/// one broken agent must not take the request or the event loop down
/// with it. This is the standard way those call sites downgrade a
/// `Result` to an `Option`.
pub trait ResultOkLogExt<T, E> {
    fn ok_log(self) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }
}
