/// A command: intent to perform an action on an aggregate or process.
///
/// Commands are **transient**: they are transformed into events (which are
/// persisted) when accepted, or rejected with a domain error. A command's
/// stable string type tag routes it to exactly one registered handler.
///
/// Commands must be:
/// - **Cloneable**: commands may be copied for retries, logging, etc.
/// - **Send + Sync + 'static**: commands cross thread boundaries (workers,
///   queue receivers) and must own all their data.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable command name/type identifier (e.g. "registration.make_seat_reservation").
    fn command_type(&self) -> &'static str;
}
